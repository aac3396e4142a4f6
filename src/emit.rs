//! Source emission buffers.
//!
//! [`SourceEmitter`] accumulates the generated text with a scope-based
//! indent counter: callers push before entering a nested block and pop on
//! leaving it, on every exit path. A secondary scratch buffer supports
//! out-of-order emission: text can be staged, trimmed from the end, and
//! spliced into the primary stream once its final shape is known, and a
//! whole fragment emitter can be built in isolation and merged back.

/// Indentation-aware text accumulator with a deferred-emission scratch
/// buffer.
#[derive(Debug)]
pub struct SourceEmitter {
    code: String,
    scratch: String,
    indent: usize,
    unit: String,
}

impl SourceEmitter {
    pub fn new(unit: impl Into<String>) -> Self {
        SourceEmitter {
            code: String::new(),
            scratch: String::new(),
            indent: 0,
            unit: unit.into(),
        }
    }

    /// Append raw text to the primary buffer.
    pub fn append(&mut self, text: &str) {
        self.code.push_str(text);
    }

    /// Append the indent prefix (unit repeated by current depth), then text.
    pub fn append_indented(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.code.push_str(&self.unit);
        }
        self.code.push_str(text);
    }

    pub fn newline(&mut self) {
        self.code.push('\n');
    }

    pub fn push_indent(&mut self) {
        self.indent += 1;
    }

    pub fn pop_indent(&mut self) {
        self.indent -= 1;
    }

    pub fn depth(&self) -> usize {
        self.indent
    }

    /// Append raw text to the scratch buffer.
    pub fn stage(&mut self, text: &str) {
        self.scratch.push_str(text);
    }

    /// Append indented text to the scratch buffer.
    pub fn stage_indented(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.scratch.push_str(&self.unit);
        }
        self.scratch.push_str(text);
    }

    /// Remove and return the last `n` characters of the scratch buffer
    /// (all of it if it holds fewer).
    pub fn pop_staged(&mut self, n: usize) -> String {
        if n == 0 {
            return String::new();
        }
        let cut = self
            .scratch
            .char_indices()
            .rev()
            .nth(n - 1)
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.scratch.split_off(cut)
    }

    /// Move the scratch buffer out, leaving it empty.
    pub fn take_staged(&mut self) -> String {
        std::mem::take(&mut self.scratch)
    }

    /// Independent emitter sharing this one's indent unit and current
    /// depth, for building a fragment in isolation.
    pub fn make_fragment(&self) -> SourceEmitter {
        SourceEmitter {
            code: String::new(),
            scratch: String::new(),
            indent: self.indent,
            unit: self.unit.clone(),
        }
    }

    /// Merge a fragment emitter's accumulated text into the scratch buffer.
    pub fn merge_fragment(&mut self, fragment: SourceEmitter) {
        self.scratch.push_str(&fragment.code);
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn finish(self) -> String {
        self.code
    }
}

impl Default for SourceEmitter {
    fn default() -> Self {
        SourceEmitter::new("    ")
    }
}
