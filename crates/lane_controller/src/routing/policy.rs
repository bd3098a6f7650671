use crate::registry::InstanceSnapshot;
use std::cmp::Ordering;

/// Orders eligible candidates, best first.
pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn rank(&self, candidates: &mut Vec<InstanceSnapshot>);
}

/// Ascending load `(occupancy + reserved) / capacity`, oldest registration
/// first on ties.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

fn compare_load(a: &InstanceSnapshot, b: &InstanceSnapshot) -> Ordering {
    // Cross-multiplied to stay in integers.
    let load_a = u64::from(a.occupancy + a.reserved) * u64::from(b.capacity);
    let load_b = u64::from(b.occupancy + b.reserved) * u64::from(a.capacity);
    load_a.cmp(&load_b)
}

fn oldest_first(a: &InstanceSnapshot, b: &InstanceSnapshot) -> Ordering {
    a.registration_seq.cmp(&b.registration_seq)
}

impl SelectionPolicy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn rank(&self, candidates: &mut Vec<InstanceSnapshot>) {
        candidates.sort_by(|a, b| compare_load(a, b).then_with(|| oldest_first(a, b)));
    }
}

/// Fills the fullest instance first, keeping others free for parties.
#[derive(Debug, Default, Clone, Copy)]
pub struct MostLoaded;

impl SelectionPolicy for MostLoaded {
    fn name(&self) -> &'static str {
        "most-loaded"
    }

    fn rank(&self, candidates: &mut Vec<InstanceSnapshot>) {
        candidates.sort_by(|a, b| {
            compare_load(b, a).then_with(|| oldest_first(a, b))
        });
    }
}
