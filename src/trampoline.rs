//! Trampoline deduplication.
//!
//! Adapters that share a flat signature and canonical options do not each
//! need their own marshaling body. They collapse into one shared trampoline
//! that takes an extra leading i32 index and dispatches through a funcref
//! table; each member keeps only a tiny wrapper that pushes its constant
//! index and tail-calls the trampoline. Adapters with a unique key stay
//! direct.
//!
//! Grouping keys on the scalar signature, the string encoding, and the
//! memory the adapter marshals through. Two adapters bound to different
//! designated memories never share a trampoline unless the policy opts in.
//!
//! Transcoding adapters go through a dispatch table even when their group
//! is a singleton: their glue needs the designated memory live, so the
//! body is deferred behind the table and filled in after the memory's
//! owner is instantiated. Only pass-through adapters can stay direct.

use std::collections::HashMap;

use crate::adapter::{Adapter, ExportRef, StringEncoding};
use crate::module::ScalarSig;

/// Controls how aggressively adapters are merged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupPolicy {
    /// Merge adapters whose designated memories differ. Off by default:
    /// the shared body would have to re-bind its memory per call, so the
    /// safe default keeps such adapters apart.
    pub share_across_memories: bool,
}

/// One funcref dispatch table backing a shared trampoline.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    pub signature: ScalarSig,
    pub encoding: StringEncoding,
    /// The memory and realloc the trampoline marshals through, when it
    /// marshals at all. `None` for pass-through groups or when sharing
    /// across memories.
    pub memory: Option<ExportRef>,
    pub realloc: Option<ExportRef>,
    /// Adapter indices in slot order. The table's size is exactly this
    /// length; slot i holds the lowered target of member i.
    pub members: Vec<usize>,
}

/// Where a deduplicated adapter's body ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterSite {
    /// The adapter keeps a private body.
    Direct,
    /// The adapter is member `slot` of dispatch table `table`.
    Shared { table: usize, slot: usize },
}

/// The deduplicator's output: one site per input adapter (same order) plus
/// the dispatch tables.
#[derive(Debug)]
pub struct DedupPlan {
    pub sites: Vec<AdapterSite>,
    pub tables: Vec<DispatchTable>,
}

impl DedupPlan {
    /// Indices of adapters that kept a private body, in input order.
    pub fn direct(&self) -> impl Iterator<Item = usize> + '_ {
        self.sites
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, AdapterSite::Direct))
            .map(|(i, _)| i)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    signature: ScalarSig,
    encoding: StringEncoding,
    memory: Option<ExportRef>,
    realloc: Option<ExportRef>,
}

/// Group adapters into shared trampolines.
///
/// Deterministic: groups appear in order of their first member, members in
/// input order, and slot indices are assigned in one pass after grouping is
/// complete. Running twice over the same input yields identical tables.
pub fn deduplicate(adapters: &[Adapter], policy: DedupPolicy) -> DedupPlan {
    let mut order: Vec<(GroupKey, Vec<usize>)> = Vec::new();
    let mut by_key: HashMap<GroupKey, usize> = HashMap::new();

    for (index, adapter) in adapters.iter().enumerate() {
        let (memory, realloc) = if policy.share_across_memories {
            (None, None)
        } else {
            (
                adapter.options.memory.clone(),
                adapter.options.realloc.clone(),
            )
        };
        let key = GroupKey {
            signature: adapter.signature.clone(),
            encoding: adapter.options.string_encoding,
            memory,
            realloc,
        };
        match by_key.get(&key) {
            Some(&slot) => order[slot].1.push(index),
            None => {
                by_key.insert(key.clone(), order.len());
                order.push((key, vec![index]));
            }
        }
    }

    // Second pass: singleton groups stay direct, the rest become tables
    // with slots in first-encountered order.
    let mut sites = vec![AdapterSite::Direct; adapters.len()];
    let mut tables = Vec::new();
    for (key, members) in order {
        let deferred = members.iter().any(|&m| adapters[m].transcodes());
        if members.len() < 2 && !deferred {
            continue;
        }
        let table = tables.len();
        for (slot, &member) in members.iter().enumerate() {
            sites[member] = AdapterSite::Shared { table, slot };
        }
        tables.push(DispatchTable {
            signature: key.signature,
            encoding: key.encoding,
            memory: key.memory,
            realloc: key.realloc,
            members,
        });
    }

    DedupPlan { sites, tables }
}
