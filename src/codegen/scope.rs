//! Lexical scopes for code generation.
//!
//! A scope binds variable names to locals and tracks which locals own a
//! runtime array. Ownership drives cleanup: when control leaves a scope
//! (fall-through, `break`, `continue`, or `return`), the arrays owned by
//! every scope being exited are released. A `return` of an owned array
//! transfers ownership to the caller instead.
//!
//! Loops get a dedicated scope carrying only the branch targets, so that
//! `break`/`continue` resolution and cleanup never have to special-case the
//! loop body's own bindings.

use fnv::FnvHashMap;

/// A resolved `break`/`continue`: the block to jump to plus the owned
/// arrays of every scope the jump exits.
pub struct JumpPlan {
    pub target: usize,
    pub released: Vec<usize>,
}

#[derive(Default)]
pub struct Scope {
    vars: FnvHashMap<String, usize>,
    owned: Vec<usize>,
    break_target: Option<usize>,
    continue_target: Option<usize>,
    label: Option<String>,
}

pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl ScopeStack {
    pub fn new() -> ScopeStack {
        // The outermost scope is the function body.
        ScopeStack {
            scopes: vec![Scope::default()],
        }
    }

    pub fn push(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn push_loop(&mut self, break_target: usize, continue_target: usize, label: Option<String>) {
        self.scopes.push(Scope {
            break_target: Some(break_target),
            continue_target: Some(continue_target),
            label,
            ..Scope::default()
        });
    }

    /// Pops the innermost scope, returning the locals whose arrays must be
    /// released now that the scope has ended.
    pub fn pop(&mut self) -> Vec<usize> {
        let scope = self
            .scopes
            .pop()
            .unwrap_or_else(|| panic!("COMPILER BUG: popping an empty scope stack"));
        scope.owned
    }

    pub fn insert_var(&mut self, name: &str, local: usize) {
        self.scopes
            .last_mut()
            .unwrap_or_else(|| panic!("COMPILER BUG: no open scope"))
            .vars
            .insert(name.to_string(), local);
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.vars.get(name).copied())
    }

    /// Marks `local` as owning a runtime array, released when its scope ends.
    pub fn mark_owned(&mut self, local: usize) {
        self.scopes
            .last_mut()
            .unwrap_or_else(|| panic!("COMPILER BUG: no open scope"))
            .owned
            .push(local);
    }

    /// Every owned local in every open scope, innermost first. Used by
    /// `return`, which exits all of them; the return site filters out the
    /// local it hands to the caller, so ownership transfer never outlives
    /// the one path that returns it.
    pub fn all_owned(&self) -> Vec<usize> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|s| s.owned.iter().copied())
            .collect()
    }

    pub fn resolve_break(&self, label: Option<&str>) -> Option<JumpPlan> {
        self.resolve(label, |s| s.break_target)
    }

    pub fn resolve_continue(&self, label: Option<&str>) -> Option<JumpPlan> {
        self.resolve(label, |s| s.continue_target)
    }

    fn resolve<F: Fn(&Scope) -> Option<usize>>(
        &self,
        label: Option<&str>,
        target_of: F,
    ) -> Option<JumpPlan> {
        let mut released = vec![];
        for scope in self.scopes.iter().rev() {
            if let Some(target) = target_of(scope) {
                let matches = match label {
                    Some(l) => scope.label.as_deref() == Some(l),
                    None => true,
                };
                if matches {
                    // The loop scope itself holds no bindings, so including
                    // its (empty) owned set keeps break and continue uniform.
                    released.extend(scope.owned.iter().copied());
                    return Some(JumpPlan { target, released });
                }
            }
            released.extend(scope.owned.iter().copied());
        }
        None
    }
}

#[cfg(test)]
mod scope_test {
    use super::*;

    #[test]
    fn test_shadowing() {
        let mut stack = ScopeStack::new();
        stack.insert_var("x", 0);
        stack.push();
        stack.insert_var("x", 1);
        assert_eq!(stack.lookup("x"), Some(1));
        stack.pop();
        assert_eq!(stack.lookup("x"), Some(0));
    }

    #[test]
    fn test_break_releases_inner_arrays() {
        let mut stack = ScopeStack::new();
        stack.push_loop(10, 11, None);
        stack.push(); // loop body
        stack.insert_var("tmp", 2);
        stack.mark_owned(2);
        let plan = stack.resolve_break(None).unwrap();
        assert_eq!(plan.target, 10);
        assert_eq!(plan.released, vec![2]);
    }

    #[test]
    fn test_labeled_continue_skips_inner_loop() {
        let mut stack = ScopeStack::new();
        stack.push_loop(10, 11, Some(str!("outer")));
        stack.push();
        stack.push_loop(20, 21, None);
        stack.push();
        stack.mark_owned(5);
        let plan = stack.resolve_continue(Some("outer")).unwrap();
        assert_eq!(plan.target, 11);
        assert_eq!(plan.released, vec![5]);
        // An unlabeled continue stays with the inner loop.
        let inner = stack.resolve_continue(None).unwrap();
        assert_eq!(inner.target, 21);
    }

    #[test]
    fn test_all_owned_spans_every_scope() {
        let mut stack = ScopeStack::new();
        stack.mark_owned(0);
        stack.push();
        stack.mark_owned(1);
        assert_eq!(stack.all_owned(), vec![1, 0]);
    }

    #[test]
    fn test_break_outside_loop() {
        let stack = ScopeStack::new();
        assert!(stack.resolve_break(None).is_none());
    }
}
