//! Lexically nested property scopes for script interpretation.
//!
//! Names are case-insensitive; every map is keyed by the lower-cased form.
//! Each scope additionally tracks a shadow set: names that were first assigned
//! in a scope nested below it. Assigning such a name after the inner scope has
//! closed is rejected, since it usually means a loop/temporary variable leaked
//! into an enclosing declaration.

use std::collections::{HashMap, HashSet};

use gantry_types::{GantryError, Result};

#[derive(Debug, Default)]
struct Scope {
    values: HashMap<String, String>,
    shadowed: HashSet<String>,
}

#[derive(Debug)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl ScopeStack {
    /// Create a stack holding the single outermost scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::default()],
        }
    }

    pub fn push(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn pop(&mut self) {
        debug_assert!(self.scopes.len() > 1);
        self.scopes.pop();
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Look a name up, innermost scope first.
    pub fn get(&self, name: &str) -> Option<&str> {
        let key = normalize(name);
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.values.get(&key))
            .map(|v| v.as_str())
    }

    /// Assign a name. The value lands in the outermost scope that already
    /// holds the name, or the current scope if it is new; every scope outside
    /// the resolved one records the name as shadowed. Assigning a name that
    /// the resolved scope has marked shadowed is an error.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        let key = normalize(name);
        let idx = self
            .scopes
            .iter()
            .position(|s| s.values.contains_key(&key))
            .unwrap_or(self.scopes.len() - 1);
        if self.scopes[idx].shadowed.contains(&key) {
            return Err(GantryError::Validation(format!(
                "property '{name}' was previously declared in a nested scope; \
                 redefining it here is probably a mistake"
            )));
        }
        self.scopes[idx].values.insert(key.clone(), value.into());
        for outer in &mut self.scopes[..idx] {
            outer.shadowed.insert(key.clone());
        }
        Ok(())
    }

    /// Assign a name directly into the current (innermost) scope, shadowing
    /// any outer definition. Used for loop variables.
    pub fn set_local(&mut self, name: &str, value: impl Into<String>) {
        let key = normalize(name);
        let last = self.scopes.len() - 1;
        self.scopes[last].values.insert(key.clone(), value.into());
        for outer in &mut self.scopes[..last] {
            outer.shadowed.insert(key.clone());
        }
    }

    /// Assign a name into the outermost scope unless it is already set
    /// anywhere on the stack. Used for environment variables.
    pub fn set_root_if_unset(&mut self, name: &str, value: impl Into<String>) {
        let key = normalize(name);
        if self.scopes.iter().any(|s| s.values.contains_key(&key)) {
            return;
        }
        self.scopes[0].values.insert(key, value.into());
    }

    /// Expand `$(Name)` references left-to-right. Unresolved names expand to
    /// the empty string and are returned so the caller can emit warnings.
    /// Expansion does not recurse into substituted values.
    pub fn expand(&self, text: &str) -> (String, Vec<String>) {
        let mut out = String::with_capacity(text.len());
        let mut unresolved = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find(')') {
                Some(end) => {
                    let name = &after[..end];
                    match self.get(name) {
                        Some(value) => out.push_str(value),
                        None => unresolved.push(name.to_string()),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // No closing parenthesis; keep the text literally.
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        (out, unresolved)
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}
