//! Variable lifetime analysis and environment-slot allocation (§4.5 Pass 3/4).
//!
//! Variable identity is textual within one clause: two occurrences with the
//! same name share one variable (DATA MODEL §3). Slots are handed out
//! first-come-first-served over permanent variables in left-to-right,
//! head-then-body order, matching the order [`analyze`]'s caller walks head
//! then body.

use std::collections::HashMap;

use crate::term::Term;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarClass {
    /// A single occurrence, or an explicitly `_`-prefixed name: compiles to
    /// `HeadVoid`/`GoalVoid`, no environment slot.
    Void,
    /// Occurs more than once (or in the head and carried to the body):
    /// needs a permanent environment slot.
    Permanent(u8),
}

#[derive(Debug, Default)]
pub struct VarInfo {
    pub classes: HashMap<String, VarClass>,
    counts: HashMap<String, usize>,
    order: Vec<String>,
    generated: HashMap<String, bool>,
}

/// Count occurrences across a clause's head and (optional) body, then
/// classify and assign slots.
pub fn analyze(head: &Term, body: Option<&Term>) -> VarInfo {
    let mut info = VarInfo::default();
    walk(head, &mut info);
    if let Some(b) = body {
        walk(b, &mut info);
    }

    let mut next_slot: u8 = 0;
    for name in info.order.clone() {
        let count = info.counts[&name];
        let void = count <= 1 || name == "_" || name.starts_with('_');
        let class = if void {
            VarClass::Void
        } else {
            let slot = next_slot;
            next_slot += 1;
            VarClass::Permanent(slot)
        };
        info.classes.insert(name, class);
    }
    info
}

/// Classify every variable in a top-level query as permanent, regardless of
/// occurrence count: unlike a clause head/body, a query has no caller
/// argument list to fold single-use variables away against, and its whole
/// point is to report bindings back once it succeeds.
pub fn analyze_query(term: &Term) -> VarInfo {
    let mut info = VarInfo::default();
    walk(term, &mut info);

    let mut next_slot: u8 = 0;
    for name in info.order.clone() {
        let void = name == "_" || name.starts_with('_');
        let class = if void {
            VarClass::Void
        } else {
            let slot = next_slot;
            next_slot += 1;
            VarClass::Permanent(slot)
        };
        info.classes.insert(name, class);
    }
    info
}

fn walk(term: &Term, info: &mut VarInfo) {
    match term {
        Term::Var(v) => {
            if !info.counts.contains_key(&v.name) {
                info.order.push(v.name.clone());
                info.counts.insert(v.name.clone(), 0);
                info.generated.insert(v.name.clone(), v.generated);
            }
            *info.counts.get_mut(&v.name).unwrap() += 1;
        }
        Term::Call(_, args) => {
            for a in args {
                walk(a, info);
            }
        }
        _ => {}
    }
}

/// `environment_size == 1 + max(slot_index_used)` (DATA MODEL §3 invariant).
pub fn environment_size(info: &VarInfo) -> usize {
    info.classes
        .values()
        .filter_map(|c| match c {
            VarClass::Permanent(slot) => Some(*slot as usize + 1),
            VarClass::Void => None,
        })
        .max()
        .unwrap_or(0)
}

/// Names with exactly one occurrence, not compiler-generated, not
/// underscore-prefixed (§4.5 "Singleton warning").
pub fn singleton_warnings(info: &VarInfo) -> Vec<String> {
    info.counts
        .iter()
        .filter(|(name, count)| {
            **count == 1 && !name.starts_with('_') && !*info.generated.get(*name).unwrap_or(&false)
        })
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::term::Variable;

    #[test]
    fn single_occurrence_is_void() {
        let mut table = crate::symbol::SymbolTable::new();
        let p = table.intern("p");
        let head = Term::Call(p, smallvec![Term::Var(Variable::named("X"))]);
        let info = analyze(&head, None);
        assert_eq!(info.classes.get("X"), Some(&VarClass::Void));
    }

    #[test]
    fn repeated_occurrence_gets_a_slot() {
        let mut table = crate::symbol::SymbolTable::new();
        let p = table.intern("p");
        let head = Term::Call(p, smallvec![Term::Var(Variable::named("X"))]);
        let body = Term::Call(p, smallvec![Term::Var(Variable::named("X"))]);
        let info = analyze(&head, Some(&body));
        assert!(matches!(info.classes.get("X"), Some(VarClass::Permanent(_))));
    }

    #[test]
    fn underscore_prefixed_is_always_void() {
        let mut table = crate::symbol::SymbolTable::new();
        let p = table.intern("p");
        let head = Term::Call(p, smallvec![Term::Var(Variable::named("_Ignored"))]);
        let body = Term::Call(p, smallvec![Term::Var(Variable::named("_Ignored"))]);
        let info = analyze(&head, Some(&body));
        assert_eq!(info.classes.get("_Ignored"), Some(&VarClass::Void));
    }

    #[test]
    fn environment_size_is_max_slot_plus_one() {
        let mut table = crate::symbol::SymbolTable::new();
        let p = table.intern("p");
        let head = Term::Call(
            p,
            smallvec![Term::Var(Variable::named("X")), Term::Var(Variable::named("Y"))],
        );
        let body = Term::Call(p, smallvec![Term::Var(Variable::named("X")), Term::Var(Variable::named("Y"))]);
        let info = analyze(&head, Some(&body));
        assert_eq!(environment_size(&info), 2);
    }
}
