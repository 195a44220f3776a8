//! Scoped parameter storage.
//!
//! All trainable variables of a process live in one `candle_nn::VarMap`.  A
//! [`ParamStore`] is a cheap handle onto that map plus a scope path; pushing a
//! scope with [`ParamStore::pp`] mirrors `VarBuilder::pp`, so a variable
//! created through `store.pp("icm_view0").pp("inverse_model").var_builder()`
//! is named `icm_view0.inverse_model.<layer>.<param>`.
//!
//! Because variables are looked up by name, rebuilding a model over a new
//! batch through the same store reuses the existing variables.
//!
//! # Example
//!
//! ```rust
//! use candle_core::Device;
//! use curio_vision::params::ParamStore;
//!
//! let store = ParamStore::new(Device::Cpu);
//! let head = store.pp("head");
//! let _ = candle_nn::linear(4, 2, head.var_builder()).unwrap();
//!
//! let params = head.collect();
//! assert_eq!(params.names().collect::<Vec<_>>(), vec!["head.bias", "head.weight"]);
//! assert!(store.pp("other").collect().is_empty());
//! ```

use std::collections::{HashMap, HashSet};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::VisionError;

/// Separator between scope components in a parameter name.
pub const SCOPE_SEPARATOR: &str = ".";

// ────────────────────────────────────────────────────────────────────────────
// ParamStore
// ────────────────────────────────────────────────────────────────────────────

/// Handle onto a shared [`VarMap`] scoped to a name path.
#[derive(Clone)]
pub struct ParamStore {
    varmap: VarMap,
    device: Device,
    path: Vec<String>,
}

impl ParamStore {
    /// Create a fresh, empty store at the root scope.
    pub fn new(device: Device) -> Self {
        Self {
            varmap: VarMap::new(),
            device,
            path: Vec::new(),
        }
    }

    /// Same variables, one scope deeper.
    pub fn pp(&self, name: impl ToString) -> Self {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Self {
            varmap: self.varmap.clone(),
            device: self.device.clone(),
            path,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Dotted scope path, empty at the root.
    pub fn prefix(&self) -> String {
        self.path.join(SCOPE_SEPARATOR)
    }

    /// Fully-qualified name of `local` inside this scope.
    pub fn qualify(&self, local: &str) -> String {
        if self.path.is_empty() {
            local.to_string()
        } else {
            format!("{}{SCOPE_SEPARATOR}{local}", self.prefix())
        }
    }

    /// A `VarBuilder` whose path matches this scope.
    pub fn var_builder(&self) -> VarBuilder<'static> {
        let root = VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device);
        self.path.iter().fold(root, |vb, p| vb.pp(p))
    }

    /// Every variable at or below this scope, ordered by name.
    pub fn collect(&self) -> ParameterSet {
        let prefix = self.prefix();
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| in_scope(name, &prefix))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        ParameterSet { entries }
    }
}

impl std::fmt::Debug for ParamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamStore")
            .field("scope", &self.prefix())
            .field("device", &self.device)
            .finish()
    }
}

fn in_scope(name: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    name.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with(SCOPE_SEPARATOR))
}

// ────────────────────────────────────────────────────────────────────────────
// ParameterSet
// ────────────────────────────────────────────────────────────────────────────

/// Ordered collection of named trainable variables.
///
/// [`push`][Self::push] and [`union`][Self::union] de-duplicate by name.
/// [`concat`][Self::concat] deliberately does not; use
/// [`disjoint_concat`][Self::disjoint_concat] when the inputs are expected to
/// be namespace-disjoint and an overlap would be a bug.
#[derive(Clone, Default)]
pub struct ParameterSet {
    entries: Vec<(String, Var)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `var` unless a parameter with that name is already present.
    /// Returns whether it was inserted.
    pub fn push(&mut self, name: impl Into<String>, var: Var) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.entries.push((name, var));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Variables in order, ready for a `candle_nn::Optimizer`.
    pub fn vars(&self) -> Vec<Var> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Total number of scalar weights.
    pub fn elem_count(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Name-deduplicated union, keeping `self`'s order first.
    pub fn union(&self, other: &ParameterSet) -> ParameterSet {
        let mut out = self.clone();
        for (name, var) in &other.entries {
            out.push(name.clone(), var.clone());
        }
        out
    }

    /// Plain concatenation; duplicates are kept.
    pub fn concat<I>(sets: I) -> ParameterSet
    where
        I: IntoIterator<Item = ParameterSet>,
    {
        ParameterSet {
            entries: sets.into_iter().flat_map(|s| s.entries).collect(),
        }
    }

    /// Concatenation that fails on the first name shared between inputs.
    pub fn disjoint_concat<I>(sets: I) -> Result<ParameterSet, VisionError>
    where
        I: IntoIterator<Item = ParameterSet>,
    {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for set in sets {
            for (name, var) in set.entries {
                if !seen.insert(name.clone()) {
                    return Err(VisionError::ParameterAliasing(name));
                }
                entries.push((name, var));
            }
        }
        Ok(ParameterSet { entries })
    }

    /// Deep copy of the current values, detached from the variables.
    pub fn snapshot(&self) -> Result<HashMap<String, Tensor>, VisionError> {
        self.entries
            .iter()
            .map(|(n, v)| Ok((n.clone(), v.as_tensor().copy()?)))
            .collect()
    }
}

impl std::fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(n, v)| (n, v.dims())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(store: &ParamStore, name: &str, n: usize) -> Var {
        let _ = store
            .var_builder()
            .get_with_hints(n, name, candle_nn::Init::Const(1.0))
            .unwrap();
        store.collect().get(&store.qualify(name)).unwrap().clone()
    }

    #[test]
    fn scopes_nest_with_dots() {
        let store = ParamStore::new(Device::Cpu);
        let scoped = store.pp("a").pp("b");
        assert_eq!(scoped.prefix(), "a.b");
        assert_eq!(scoped.qualify("w"), "a.b.w");
        assert_eq!(store.qualify("w"), "w");
    }

    #[test]
    fn collect_respects_scope_boundaries() {
        let store = ParamStore::new(Device::Cpu);
        var(&store.pp("view1"), "w", 2);
        var(&store.pp("view10"), "w", 2);
        let names: Vec<String> = store
            .pp("view1")
            .collect()
            .names()
            .map(str::to_string)
            .collect();
        assert_eq!(names, vec!["view1.w".to_string()]);
        assert_eq!(store.collect().len(), 2);
    }

    #[test]
    fn same_name_resolves_to_same_variable() {
        let store = ParamStore::new(Device::Cpu);
        let a = var(&store.pp("s"), "w", 3);
        let b = var(&store.pp("s"), "w", 3);
        assert_eq!(a.as_tensor().id(), b.as_tensor().id());
        assert_eq!(store.collect().len(), 1);
    }

    #[test]
    fn push_and_union_deduplicate() {
        let store = ParamStore::new(Device::Cpu);
        let w = var(&store, "w", 1);
        let mut set = ParameterSet::new();
        assert!(set.push("w", w.clone()));
        assert!(!set.push("w", w.clone()));
        let merged = set.union(&set.clone());
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn concat_keeps_duplicates_but_disjoint_concat_rejects_them() {
        let store = ParamStore::new(Device::Cpu);
        var(&store, "w", 1);
        let set = store.collect();
        assert_eq!(ParameterSet::concat([set.clone(), set.clone()]).len(), 2);
        let err = ParameterSet::disjoint_concat([set.clone(), set]).unwrap_err();
        assert!(matches!(err, VisionError::ParameterAliasing(name) if name == "w"));
    }

    #[test]
    fn snapshot_is_detached_from_later_updates() {
        let store = ParamStore::new(Device::Cpu);
        let w = var(&store, "w", 2);
        let snap = store.collect().snapshot().unwrap();
        w.set(&Tensor::new(&[5.0f32, 5.0], &Device::Cpu).unwrap()).unwrap();
        assert_eq!(snap["w"].to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
        assert_eq!(w.as_tensor().to_vec1::<f32>().unwrap(), vec![5.0, 5.0]);
    }
}
