//! Tundra lowering.
//!
//! Lowers one shader or function declaration at a time into Tundra source.
//! The dispatcher is a single match over node kinds; each kind has exactly
//! one rule, and a kind without a rule is a hard error rather than a silent
//! skip. Two concerns shape most rules:
//!
//! - Overloading in the target is purely syntactic, so every polymorphic
//!   operation (user functions, binary operators, casts, boolean coercion)
//!   is compiled to a name carrying mangled operand types. Declarations and
//!   call sites share one suffix builder so they cannot drift apart.
//! - The source language's ambient shading state (position, normals, the
//!   accumulated output closure, ...) becomes an explicit `shader_inout`
//!   value: copied into locals at every body entry, reconstructed at every
//!   call site and exit point, and written back after calls.

use std::collections::BTreeSet;

use log::{debug, trace};

use crate::arrays;
use crate::ast::{Arena, BinOp, IncDec, LiteralValue, LoopKind, NodeId, NodeKind, UnaryOp};
use crate::bail_unsupported;
use crate::emit::SourceEmitter;
use crate::error::Result;
use crate::mangle::{identifier_fragment, mangled_type, overload_suffix};
use crate::types::{StructSpec, TypeSpec};

/// Ambient per-point state threaded through generated shaders and
/// functions, as `(field name, writable)`. Writable fields are rebound
/// `let mut` at body entry and written back after calls; the prologue, the
/// reconstruction literal, and the write-back sites all derive from this
/// one table.
const SHADER_STATE_FIELDS: [(&str, bool); 13] = [
    ("P", true),
    ("I", false),
    ("N", true),
    ("Ng", false),
    ("dPdu", false),
    ("dPdv", false),
    ("Ps", false),
    ("u", false),
    ("v", false),
    ("time", false),
    ("dtime", false),
    ("dPdtime", false),
    ("Ci", true),
];

/// Tundra type name of the state bundle.
const STATE_TYPE: &str = "shader_inout";

/// Sentinel emitted for a closure constructed from an integer (the
/// canonical zero closure).
const EMPTY_CLOSURE: &str = "EMPTY_CLOSURE";

const INDENT_UNIT: &str = "    ";

/// Kind of body surrounding the node being lowered. Output parameters are
/// plain mutable locals at shader-body top level but references inside
/// functions, so assignment and prologue/epilogue shapes branch on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Shader,
    Function,
}

/// Output of lowering one compilation unit.
#[derive(Debug, Clone)]
pub struct TundraOutput {
    pub code: String,
    /// Distinct string literals encountered, for constant-pool emission.
    pub string_constants: BTreeSet<String>,
}

/// Lower one shader or function AST rooted at `root`.
pub fn lower(arena: &mut Arena, root: NodeId) -> Result<TundraOutput> {
    let mut backend = TundraBackend::new();
    let code = backend.lower(arena, root)?;
    Ok(TundraOutput {
        code,
        string_constants: backend.into_string_constants(),
    })
}

/// Backend entry point. Holds no lowering state between units except the
/// accumulated set of distinct string literals.
#[derive(Debug, Default)]
pub struct TundraBackend {
    const_strings: BTreeSet<String>,
    indent_unit: Option<String>,
}

impl TundraBackend {
    pub fn new() -> Self {
        TundraBackend::default()
    }

    /// Override the indent unit used in emitted text.
    pub fn with_indent_unit(unit: impl Into<String>) -> Self {
        TundraBackend {
            const_strings: BTreeSet::new(),
            indent_unit: Some(unit.into()),
        }
    }

    fn unit(&self) -> &str {
        self.indent_unit.as_deref().unwrap_or(INDENT_UNIT)
    }

    /// Lower one shader or function declaration to Tundra source.
    ///
    /// The arena is borrowed exclusively for the duration of the call;
    /// synthesized constructor nodes are appended to it. On error nothing
    /// is emitted and the string-constant set is left untouched.
    pub fn lower(&mut self, arena: &mut Arena, root: NodeId) -> Result<String> {
        let mut ctx = LowerCtx::new(arena, self.unit());
        ctx.lower_unit(root)?;
        self.const_strings.append(&mut ctx.const_strings);
        Ok(ctx.source.finish())
    }

    /// Emit the Tundra definition of a user structure type. Called once per
    /// structure type actually used by the shader group.
    pub fn struct_definition(&self, spec: &StructSpec) -> Result<String> {
        let mut source = SourceEmitter::new(self.unit());
        source.append_indented(&format!("struct {} {{\n", spec.name));
        source.push_indent();
        for field in &spec.fields {
            let field_type = mangled_type(&field.ty, None)?;
            source.append_indented(&format!("{}: {},\n", field.name, field_type));
        }
        source.pop_indent();
        source.append_indented("}\n\n");
        Ok(source.finish())
    }

    pub fn string_constants(&self) -> &BTreeSet<String> {
        &self.const_strings
    }

    pub fn into_string_constants(self) -> BTreeSet<String> {
        self.const_strings
    }
}

/// Identifier under which a string literal is pooled.
pub fn string_constant_name(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Per-unit lowering state: the emitter, the arena borrow, and the string
/// literals seen so far. Everything else is threaded through the recursive
/// calls as [`Scope`].
pub(crate) struct LowerCtx<'a> {
    arena: &'a mut Arena,
    pub(crate) source: SourceEmitter,
    pub(crate) const_strings: BTreeSet<String>,
}

impl<'a> LowerCtx<'a> {
    pub(crate) fn new(arena: &'a mut Arena, unit: &str) -> Self {
        LowerCtx {
            arena,
            source: SourceEmitter::new(unit),
            const_strings: BTreeSet::new(),
        }
    }

    pub(crate) fn lower_unit(&mut self, root: NodeId) -> Result<()> {
        match self.arena.kind(root) {
            NodeKind::ShaderDeclaration { .. } | NodeKind::FunctionDeclaration { .. } => {
                self.dispatch(root, Scope::Function)
            }
            other => bail_unsupported!(
                "lowering must start at a shader or function declaration, found a {}",
                other.describe()
            ),
        }
    }

    pub(crate) fn dispatch(&mut self, id: NodeId, scope: Scope) -> Result<()> {
        trace!("dispatch {}", self.arena.kind(id).describe());
        let kind = self.arena.kind(id).clone();
        match kind {
            NodeKind::ShaderDeclaration {
                name,
                formals,
                statements,
            } => self.lower_shader_declaration(&name, &formals, &statements),
            NodeKind::FunctionDeclaration {
                name,
                formals,
                statements,
                is_builtin,
            } => self.lower_function_declaration(id, &name, &formals, &statements, is_builtin),
            NodeKind::VariableDeclaration { name, init, .. } => {
                self.lower_variable_declaration(id, &name, init, scope)
            }
            NodeKind::CompoundInitializer { elems } => {
                self.lower_compound_initializer(&elems, scope)
            }
            NodeKind::VariableRef { name, .. } => {
                self.source.append(&name);
                Ok(())
            }
            NodeKind::PreIncDec { op, var } => self.lower_preincdec(op, var, scope),
            NodeKind::PostIncDec { op, .. } => bail_unsupported!("post-{}", op.word()),
            NodeKind::Index { lvalue, index } => self.lower_index(lvalue, index, scope),
            NodeKind::StructSelect {
                lvalue,
                field,
                comp_index,
            } => self.lower_struct_select(lvalue, &field, comp_index, scope),
            NodeKind::ConditionalStatement {
                cond,
                true_stmts,
                false_stmts,
            } => self.lower_conditional(cond, &true_stmts, &false_stmts, scope),
            NodeKind::LoopStatement {
                kind,
                init,
                cond,
                iter,
                statements,
            } => self.lower_loop(kind, init, cond, iter, &statements, scope),
            NodeKind::LoopModStatement { op } => {
                bail_unsupported!("{} statement", op.keyword())
            }
            NodeKind::ReturnStatement { expr } => self.lower_return(expr, scope),
            NodeKind::BinaryExpression { op, left, right } => {
                self.lower_binary(op, left, right, scope)
            }
            NodeKind::UnaryExpression { op, expr } => self.lower_unary(op, expr, scope),
            NodeKind::AssignExpression { var, expr } => self.lower_assign(id, var, expr, scope),
            NodeKind::TernaryExpression {
                cond,
                true_expr,
                false_expr,
            } => self.lower_ternary(cond, true_expr, false_expr, scope),
            NodeKind::CommaOperator { .. } => bail_unsupported!("comma operator"),
            NodeKind::TypecastExpression { expr } => self.lower_typecast(id, expr, scope),
            NodeKind::TypeConstructor { args } => self.lower_type_constructor(id, &args, scope),
            NodeKind::FunctionCall {
                name,
                args,
                is_struct_ctor,
                callee,
            } => self.lower_function_call(id, &name, &args, is_struct_ctor, callee, scope),
            NodeKind::Literal(lit) => self.lower_literal(&lit),
        }
    }

    /// Tundra type name of a node, resolving an unsized array declaration's
    /// length through its initializer.
    fn type_name_of(&self, id: NodeId) -> Result<String> {
        let ty = self.arena.ty(id);
        if ty.is_unsized_array() {
            if let NodeKind::VariableDeclaration {
                init: Some(init), ..
            } = self.arena.kind(id)
            {
                let len = arrays::resolved_len(&*self.arena, *init)?;
                return mangled_type(ty, Some(len));
            }
        }
        mangled_type(ty, None)
    }

    /// Lower `id` into an isolated fragment and return its text. The
    /// fragment shares the current indent depth, so multi-line fragments
    /// splice correctly at the call site.
    fn lower_to_fragment(&mut self, id: NodeId, scope: Scope) -> Result<String> {
        let fragment = self.source.make_fragment();
        let outer = std::mem::replace(&mut self.source, fragment);
        let result = self.dispatch(id, scope);
        let fragment = std::mem::replace(&mut self.source, outer);
        result?;
        self.source.merge_fragment(fragment);
        Ok(self.source.take_staged())
    }

    /// Build the state reconstruction literal at the current depth.
    fn state_constructor(&mut self) -> String {
        let mut fragment = self.source.make_fragment();
        fragment.append(&format!("{} {{\n", STATE_TYPE));
        fragment.push_indent();
        for (field, _) in SHADER_STATE_FIELDS {
            fragment.append_indented(&format!("{} = {},\n", field, field));
        }
        fragment.pop_indent();
        fragment.append_indented("}");
        self.source.merge_fragment(fragment);
        self.source.take_staged()
    }

    /// Rebind every state field as a local at body entry.
    fn emit_state_prologue(&mut self) {
        for (field, writable) in SHADER_STATE_FIELDS {
            let mutability = if writable { "mut " } else { "" };
            self.source
                .append_indented(&format!("let {}{} = inout.{};\n", mutability, field, field));
        }
    }

    fn formal_info(&self, id: NodeId) -> Result<(String, bool, Option<NodeId>)> {
        match self.arena.kind(id) {
            NodeKind::VariableDeclaration {
                name,
                is_output,
                init,
            } => Ok((name.clone(), *is_output, *init)),
            other => bail_unsupported!("formal parameter that is a {}", other.describe()),
        }
    }

    /// Conditional and loop statements indent themselves; everything else
    /// gets an indent prefix and a terminator.
    fn lower_statement_list(&mut self, statements: &[NodeId], scope: Scope) -> Result<()> {
        for &stmt in statements {
            match self.arena.kind(stmt) {
                NodeKind::LoopStatement { .. } | NodeKind::ConditionalStatement { .. } => {
                    self.dispatch(stmt, scope)?;
                }
                _ => {
                    self.source.append_indented("");
                    self.dispatch(stmt, scope)?;
                    self.source.append(";\n");
                }
            }
        }
        Ok(())
    }

    /// A shader becomes four artifacts: the input struct, its factory, the
    /// output struct, and the implementation function that threads the
    /// state bundle.
    fn lower_shader_declaration(
        &mut self,
        name: &str,
        formals: &[NodeId],
        statements: &[NodeId],
    ) -> Result<()> {
        debug!("lowering shader '{}'", name);

        self.source
            .append_indented(&format!("struct {}_in {{\n", name));
        self.source.push_indent();
        let mut outputs = Vec::new();
        for &f in formals {
            let (fname, is_output, _) = self.formal_info(f)?;
            if is_output {
                outputs.push((f, fname.clone()));
            }
            let type_name = self.type_name_of(f)?;
            self.source
                .append_indented(&format!("{}: {},\n", fname, type_name));
        }
        self.source.pop_indent();
        self.source.append_indented("}\n\n");

        self.source
            .append_indented(&format!("fn make_{}_in() -> {}_in {{\n", name, name));
        self.source.push_indent();
        for &f in formals {
            let (fname, _, init) = self.formal_info(f)?;
            let Some(init) = init else {
                bail_unsupported!("shader parameter '{}' without a default initializer", fname)
            };
            let type_name = self.type_name_of(f)?;
            self.source
                .append_indented(&format!("let {}: {} = ", fname, type_name));
            if matches!(self.arena.kind(init), NodeKind::Literal(_)) {
                // Coerce the literal to the declared parameter type.
                let ty = self.arena.ty(f).clone();
                let ctor = self
                    .arena
                    .push(NodeKind::TypeConstructor { args: vec![init] }, ty);
                self.dispatch(ctor, Scope::Shader)?;
            } else {
                self.dispatch(init, Scope::Shader)?;
            }
            self.source.append(";\n");
        }
        self.source.append_indented(&format!("{}_in {{\n", name));
        self.source.push_indent();
        for &f in formals {
            let (fname, _, _) = self.formal_info(f)?;
            self.source
                .append_indented(&format!("{} = {},\n", fname, fname));
        }
        self.source.pop_indent();
        self.source.append_indented("}\n");
        self.source.pop_indent();
        self.source.append_indented("}\n\n");

        self.source
            .append_indented(&format!("struct {}_out {{\n", name));
        self.source.push_indent();
        for (f, fname) in &outputs {
            let type_name = self.type_name_of(*f)?;
            self.source
                .append_indented(&format!("{}: {},\n", fname, type_name));
        }
        self.source.pop_indent();
        self.source.append_indented("}\n\n");

        self.source.append_indented(&format!(
            "fn @{}_impl(arg_in: {}_in, inout: {}) -> ({}_out, {}) {{\n",
            name, name, STATE_TYPE, name, STATE_TYPE
        ));
        self.source.push_indent();
        for &f in formals {
            let (fname, is_output, _) = self.formal_info(f)?;
            let mutability = if is_output { "mut " } else { "" };
            self.source.append_indented(&format!(
                "let {}{} = arg_in.{};\n",
                mutability, fname, fname
            ));
        }
        self.emit_state_prologue();

        self.lower_statement_list(statements, Scope::Shader)?;

        self.source
            .append_indented(&format!("({}_out {{\n", name));
        self.source.push_indent();
        for (_, fname) in &outputs {
            self.source
                .append_indented(&format!("{} = {},\n", fname, fname));
        }
        self.source.pop_indent();
        self.source.append_indented("},\n");
        self.source.append_indented("");
        let state = self.state_constructor();
        self.source.append(&state);
        self.source.append(")\n");
        self.source.pop_indent();
        self.source.append_indented("}\n\n");
        Ok(())
    }

    /// Non-builtin functions get an overload-suffixed name, reference
    /// passing for outputs and arrays, and the state bundle as trailing
    /// parameter and trailing return value. Builtins are never lowered;
    /// the target runtime library already defines them.
    fn lower_function_declaration(
        &mut self,
        id: NodeId,
        name: &str,
        formals: &[NodeId],
        statements: &[NodeId],
        is_builtin: bool,
    ) -> Result<()> {
        if is_builtin {
            return Ok(());
        }
        debug!("lowering function '{}'", name);

        let mut param_types = Vec::with_capacity(formals.len());
        for &f in formals {
            param_types.push(self.type_name_of(f)?);
        }
        let return_type = self.type_name_of(id)?;
        let suffix = overload_suffix(&param_types, &return_type);

        self.source.append(&format!("fn @{}{}(", name, suffix));
        for (i, &f) in formals.iter().enumerate() {
            let (fname, is_output, _) = self.formal_info(f)?;
            let is_array = self.arena.ty(f).is_array();
            let by_ref = if is_output { "&mut " } else { "" };
            let array_ref = if is_array { "&" } else { "" };
            self.source.append(&format!(
                "{}: {}{}{}, ",
                fname, by_ref, array_ref, param_types[i]
            ));
            if is_array {
                // The target cannot recover a reference's length; pass an
                // accessor alongside.
                self.source
                    .append(&format!("{}_length: fn() -> i32, ", fname));
            }
        }
        self.source.append(&format!(
            "inout: {}) -> ({}, {}) {{\n",
            STATE_TYPE, return_type, STATE_TYPE
        ));
        self.source.push_indent();
        self.emit_state_prologue();
        self.lower_statement_list(statements, Scope::Function)?;
        if self.arena.ty(id) == &TypeSpec::Unit {
            // Value-less fall-through still reconstructs the bundle.
            self.source.append_indented("((), ");
            let state = self.state_constructor();
            self.source.append(&state);
            self.source.append(")\n");
        }
        self.source.pop_indent();
        self.source.append_indented("}\n\n");
        Ok(())
    }

    fn lower_variable_declaration(
        &mut self,
        id: NodeId,
        name: &str,
        init: Option<NodeId>,
        scope: Scope,
    ) -> Result<()> {
        let type_name = self.type_name_of(id)?;
        self.source
            .append(&format!("let mut {}: {}", name, type_name));
        if let Some(init) = init {
            self.source.append(" = ");
            if matches!(self.arena.kind(init), NodeKind::TypeConstructor { .. }) {
                self.dispatch(init, scope)?;
            } else {
                // Route every initializer through the constructor rule so
                // coercion and aggregate expansion apply uniformly.
                let ty = self.arena.ty(id).clone();
                let ctor = self
                    .arena
                    .push(NodeKind::TypeConstructor { args: vec![init] }, ty);
                self.dispatch(ctor, scope)?;
            }
        }
        Ok(())
    }

    fn lower_compound_initializer(&mut self, elems: &[NodeId], scope: Scope) -> Result<()> {
        self.source.append("[");
        for (i, &elem) in elems.iter().enumerate() {
            if i > 0 {
                self.source.append(", ");
            }
            self.dispatch(elem, scope)?;
        }
        self.source.append("]");
        Ok(())
    }

    /// Pre-increment/decrement: mutate in place, then yield the value.
    fn lower_preincdec(&mut self, op: IncDec, var: NodeId, scope: Scope) -> Result<()> {
        self.source.append("{ ");
        self.dispatch(var, scope)?;
        self.source.append(&format!(" {}= 1; ", op.sign()));
        self.dispatch(var, scope)?;
        self.source.append(" }");
        Ok(())
    }

    /// Triples are not natively indexable in the target; go through the
    /// per-type accessor instead.
    fn lower_index(&mut self, lvalue: NodeId, index: NodeId, scope: Scope) -> Result<()> {
        if self.arena.ty(lvalue).is_triple() {
            let name = self.type_name_of(lvalue)?;
            self.source.append(&format!("index_{}(", name));
            self.dispatch(lvalue, scope)?;
            self.source.append(", ");
            self.dispatch(index, scope)?;
            self.source.append(")");
        } else {
            self.dispatch(lvalue, scope)?;
            self.source.append("[");
            self.dispatch(index, scope)?;
            self.source.append("]");
        }
        Ok(())
    }

    fn lower_struct_select(
        &mut self,
        lvalue: NodeId,
        field: &str,
        comp_index: Option<NodeId>,
        scope: Scope,
    ) -> Result<()> {
        if let Some(comp) = comp_index {
            // x/y/z selection already resolved upstream.
            self.dispatch(comp, scope)
        } else {
            self.dispatch(lvalue, scope)?;
            self.source.append(&format!(".{}", field));
            Ok(())
        }
    }

    /// Non-boolean conditions are wrapped in the mangled truthiness
    /// coercion; the target has no implicit int-to-bool conversion.
    fn lower_conditional(
        &mut self,
        cond: NodeId,
        true_stmts: &[NodeId],
        false_stmts: &[NodeId],
        scope: Scope,
    ) -> Result<()> {
        let native_bool = matches!(
            self.arena.kind(cond),
            NodeKind::BinaryExpression { op, .. } if op.is_boolean()
        );
        if native_bool {
            self.source.append_indented("if (");
            self.dispatch(cond, scope)?;
            self.source.append(") {\n");
        } else {
            let cond_type = self.type_name_of(cond)?;
            self.source.append_indented(&format!(
                "if (make_bool_{}(",
                identifier_fragment(&cond_type)
            ));
            self.dispatch(cond, scope)?;
            self.source.append(")) {\n");
        }
        self.source.push_indent();
        self.lower_statement_list(true_stmts, scope)?;
        self.source.pop_indent();
        self.source.append_indented("}");
        if !false_stmts.is_empty() {
            self.source.append(" else {\n");
            self.source.push_indent();
            self.lower_statement_list(false_stmts, scope)?;
            self.source.pop_indent();
            self.source.append_indented("}");
        }
        self.source.append("\n");
        Ok(())
    }

    /// All three source loop forms become the target's `while`. A `for`
    /// gains an enclosing block so the induction variable's scope matches
    /// the source; a `do` runs its body inside the condition block so it
    /// executes before the first test.
    fn lower_loop(
        &mut self,
        kind: LoopKind,
        init: Option<NodeId>,
        cond: NodeId,
        iter: Option<NodeId>,
        statements: &[NodeId],
        scope: Scope,
    ) -> Result<()> {
        match kind {
            LoopKind::For => {
                self.source.append_indented("{\n");
                self.source.push_indent();
                if let Some(init) = init {
                    self.source.append_indented("");
                    self.dispatch(init, scope)?;
                    self.source.append(";\n");
                }
                self.source.append_indented("while (");
                self.dispatch(cond, scope)?;
                self.source.append(") {\n");
            }
            LoopKind::While => {
                self.source.append_indented("while (");
                self.dispatch(cond, scope)?;
                self.source.append(") {\n");
            }
            LoopKind::DoWhile => {
                self.source.append_indented("while ({\n");
            }
        }
        self.source.push_indent();
        self.lower_statement_list(statements, scope)?;
        match kind {
            LoopKind::For => {
                if let Some(iter) = iter {
                    self.source.append_indented("");
                    self.dispatch(iter, scope)?;
                    self.source.append(";\n");
                }
                self.source.pop_indent();
                self.source.append_indented("}\n");
                self.source.pop_indent();
                self.source.append_indented("}\n");
            }
            LoopKind::While => {
                self.source.pop_indent();
                self.source.append_indented("}\n");
            }
            LoopKind::DoWhile => {
                self.source.append_indented("");
                self.dispatch(cond, scope)?;
                self.source.append("\n");
                self.source.pop_indent();
                self.source.append_indented("}) { }\n");
            }
        }
        Ok(())
    }

    fn lower_return(&mut self, expr: Option<NodeId>, scope: Scope) -> Result<()> {
        match scope {
            Scope::Shader => {
                if let Some(expr) = expr {
                    self.source.append("return ");
                    self.dispatch(expr, scope)?;
                } else {
                    self.source.append("return");
                }
            }
            Scope::Function => {
                // Every function exit rebuilds the state bundle.
                self.source.append("return (");
                match expr {
                    Some(expr) => self.dispatch(expr, scope)?,
                    None => self.source.append("()"),
                }
                self.source.append(", ");
                let state = self.state_constructor();
                self.source.append(&state);
                self.source.append(")");
            }
        }
        Ok(())
    }

    fn lower_binary(&mut self, op: BinOp, left: NodeId, right: NodeId, scope: Scope) -> Result<()> {
        if op.is_boolean() {
            self.source.append("(");
            self.dispatch(left, scope)?;
            self.source.append(&format!(") {} (", op.symbol()));
            self.dispatch(right, scope)?;
            self.source.append(")");
        } else {
            let left_type = identifier_fragment(&self.type_name_of(left)?);
            let right_type = identifier_fragment(&self.type_name_of(right)?);
            self.source.append(&format!(
                "ops_{}().{}_{}(",
                left_type,
                op.opword(),
                right_type
            ));
            self.dispatch(left, scope)?;
            self.source.append(", ");
            self.dispatch(right, scope)?;
            self.source.append(")");
        }
        Ok(())
    }

    fn lower_unary(&mut self, op: UnaryOp, expr: NodeId, scope: Scope) -> Result<()> {
        self.source.append(&format!("{}(", op.symbol()));
        self.dispatch(expr, scope)?;
        self.source.append(")");
        Ok(())
    }

    fn lower_assign(&mut self, id: NodeId, var: NodeId, expr: NodeId, scope: Scope) -> Result<()> {
        if scope == Scope::Function {
            if let NodeKind::VariableRef { decl, .. } = self.arena.kind(var) {
                if let NodeKind::VariableDeclaration {
                    is_output: true, ..
                } = self.arena.kind(*decl)
                {
                    // Output formals are references outside shader scope.
                    self.source.append("*");
                }
            }
        }
        self.dispatch(var, scope)?;
        self.source.append(" = ");
        if matches!(self.arena.kind(expr), NodeKind::Literal(_)) {
            let ty = self.arena.ty(id).clone();
            let ctor = self
                .arena
                .push(NodeKind::TypeConstructor { args: vec![expr] }, ty);
            self.dispatch(ctor, scope)?;
        } else if self.arena.ty(id) != self.arena.ty(expr) {
            self.source.append("(");
            self.dispatch(expr, scope)?;
            let type_name = self.type_name_of(id)?;
            self.source.append(&format!(") as {}", type_name));
        } else {
            self.dispatch(expr, scope)?;
        }
        Ok(())
    }

    /// The target has no ternary operator; conditionals are value-yielding
    /// statements.
    fn lower_ternary(
        &mut self,
        cond: NodeId,
        true_expr: NodeId,
        false_expr: NodeId,
        scope: Scope,
    ) -> Result<()> {
        self.source.append("if (");
        self.dispatch(cond, scope)?;
        self.source.append(") { ");
        self.dispatch(true_expr, scope)?;
        self.source.append(" } else { ");
        self.dispatch(false_expr, scope)?;
        self.source.append(" }");
        Ok(())
    }

    fn lower_typecast(&mut self, id: NodeId, expr: NodeId, scope: Scope) -> Result<()> {
        let from = identifier_fragment(&self.type_name_of(expr)?);
        let to = identifier_fragment(&self.type_name_of(id)?);
        self.source.append(&format!("ops_{}().as_{}(", from, to));
        self.dispatch(expr, scope)?;
        self.source.append(")");
        Ok(())
    }

    /// Single-argument constructor rule against a destination type; the
    /// aggregate rule recurses through this for every positional argument.
    fn lower_ctor_value(&mut self, target: &TypeSpec, arg: NodeId, scope: Scope) -> Result<String> {
        let ctor = self
            .arena
            .push(NodeKind::TypeConstructor { args: vec![arg] }, target.clone());
        self.lower_to_fragment(ctor, scope)
    }

    fn lower_type_constructor(&mut self, id: NodeId, args: &[NodeId], scope: Scope) -> Result<()> {
        let target = self.arena.ty(id).clone();

        // Copy construction: a single argument already of the target type
        // passes through untouched.
        if let [arg] = args {
            if self.arena.ty(*arg) == &target {
                return self.dispatch(*arg, scope);
            }
        }

        if target.is_numeric_scalar() {
            let [arg] = args else {
                bail_unsupported!("scalar constructor with {} arguments", args.len())
            };
            if matches!(self.arena.kind(*arg), NodeKind::Literal(_)) {
                return self.dispatch(*arg, scope);
            }
            self.source.append("(");
            self.dispatch(*arg, scope)?;
            let type_name = mangled_type(&target, None)?;
            self.source.append(&format!(") as {}", type_name));
            return Ok(());
        }

        if target == TypeSpec::Closure {
            if let [arg] = args {
                if matches!(self.arena.ty(*arg), TypeSpec::Int) {
                    self.source.append(EMPTY_CLOSURE);
                    return Ok(());
                }
            }
        }

        // Aggregate literal. Values are fully lowered first, then the field
        // list is staged and spliced so the literal closes cleanly.
        let values = if target.is_triple() && args.len() == 1 {
            // One scalar broadcasts to all three components.
            let value = self.lower_ctor_value(&TypeSpec::Float, args[0], scope)?;
            vec![value.clone(), value.clone(), value]
        } else {
            let mut values = Vec::with_capacity(args.len());
            for (i, &arg) in args.iter().enumerate() {
                let field_type = ctor_field_type(&target, i)?;
                values.push(self.lower_ctor_value(&field_type, arg, scope)?);
            }
            values
        };

        let type_name = mangled_type(&target, None)?;
        for (i, value) in values.iter().enumerate() {
            let field = ctor_field_name(&target, i)?;
            self.source.stage(&format!("{} = {}, ", field, value));
        }
        self.source.pop_staged(2);
        let fields = self.source.take_staged();
        self.source
            .append(&format!("{}{{{}}}", type_name, fields));
        Ok(())
    }

    /// Overloaded call: mangled name from argument and return types (the
    /// declaration builds its name the same way), reference passing per the
    /// callee's formals, state bundle appended and written back.
    fn lower_function_call(
        &mut self,
        id: NodeId,
        name: &str,
        args: &[NodeId],
        is_struct_ctor: bool,
        callee: Option<NodeId>,
        scope: Scope,
    ) -> Result<()> {
        if is_struct_ctor {
            let ty = self.arena.ty(id).clone();
            let ctor = self
                .arena
                .push(NodeKind::TypeConstructor { args: args.to_vec() }, ty);
            return self.dispatch(ctor, scope);
        }

        let mut arg_types = Vec::with_capacity(args.len());
        for &arg in args {
            arg_types.push(self.type_name_of(arg)?);
        }
        let return_type = self.type_name_of(id)?;
        let suffix = overload_suffix(&arg_types, &return_type);

        let formals: Vec<NodeId> = match callee {
            Some(decl) => match self.arena.kind(decl) {
                NodeKind::FunctionDeclaration { formals, .. } => formals.clone(),
                other => bail_unsupported!("call target that is a {}", other.describe()),
            },
            None => Vec::new(),
        };

        self.source
            .append(&format!("{{ let (call_ret, call_inout) = {}{}(", name, suffix));
        for (i, &arg) in args.iter().enumerate() {
            let output_formal = formals.get(i).is_some_and(|&f| {
                matches!(
                    self.arena.kind(f),
                    NodeKind::VariableDeclaration {
                        is_output: true,
                        ..
                    }
                )
            });
            if output_formal {
                self.source.append("&mut ");
            }
            let is_array = self.arena.ty(arg).is_array();
            if is_array {
                self.source.append("&");
            }
            self.dispatch(arg, scope)?;
            self.source.append(", ");
            if is_array {
                let len = arrays::resolved_len(&*self.arena, arg)?;
                self.source.append(&format!("||{{{}}}, ", len));
            }
        }
        let state = self.state_constructor();
        self.source.append(&state);
        self.source.append("); ");
        for (field, writable) in SHADER_STATE_FIELDS {
            if writable {
                self.source
                    .append(&format!("{} = call_inout.{}; ", field, field));
            }
        }
        self.source.append("call_ret }");
        Ok(())
    }

    fn lower_literal(&mut self, lit: &LiteralValue) -> Result<()> {
        match lit {
            LiteralValue::Int(v) => self.source.append(&v.to_string()),
            LiteralValue::Float(v) => {
                let mut text = v.to_string();
                if !text.contains('.') && !text.contains('e') && !text.contains('E') {
                    text.push_str(".0");
                }
                self.source.append(&text);
            }
            LiteralValue::Str(s) => {
                self.const_strings.insert(s.clone());
                let name = if s.is_empty() {
                    "empty_string".to_string()
                } else {
                    string_constant_name(s)
                };
                self.source.append(&format!("String::{}", name));
            }
        }
        Ok(())
    }
}

/// Destination field name for positional constructor argument `i`.
fn ctor_field_name(ts: &TypeSpec, i: usize) -> Result<String> {
    match ts {
        TypeSpec::Triple(_) => match i {
            0 => Ok("x".to_string()),
            1 => Ok("y".to_string()),
            2 => Ok("z".to_string()),
            _ => bail_unsupported!("triple constructor argument {}", i),
        },
        TypeSpec::Matrix => {
            if i < 16 {
                Ok(format!("m{}_n{}", i / 4 + 1, i % 4 + 1))
            } else {
                bail_unsupported!("matrix constructor argument {}", i)
            }
        }
        TypeSpec::Struct(spec) => match spec.field(i) {
            Some(field) => Ok(field.name.clone()),
            None => bail_unsupported!(
                "structure '{}' constructor argument {}",
                spec.name,
                i
            ),
        },
        other => bail_unsupported!("aggregate construction of {:?}", other),
    }
}

/// Destination field type for positional constructor argument `i`.
fn ctor_field_type(ts: &TypeSpec, i: usize) -> Result<TypeSpec> {
    match ts {
        TypeSpec::Triple(_) | TypeSpec::Matrix => Ok(TypeSpec::Float),
        TypeSpec::Struct(spec) => match spec.field(i) {
            Some(field) => Ok(field.ty.clone()),
            None => bail_unsupported!(
                "structure '{}' constructor argument {}",
                spec.name,
                i
            ),
        },
        other => bail_unsupported!("aggregate construction of {:?}", other),
    }
}
