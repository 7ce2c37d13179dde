use crate::config::NUM_TEMPORAL_VALUES;
use crate::database::{Database, TemporalIndexRecord};
use sha2::{Digest, Sha256};

/// Pick the temporal index for (`user`, `origin`).
///
/// A pair that already has an index keeps it. A new pair gets the index
/// least used by other users at the same origin, lowest index on ties.
/// Once every index at an origin is taken, indices are shared between
/// users, which makes them linkable; that is logged, not refused.
pub fn choose_temporal_index(db: &mut dyn Database, user: &str, origin: &str) -> u32 {
    let user_hash = Sha256::digest(user.as_bytes()).to_vec();
    let origin_hash = Sha256::digest(origin.as_bytes()).to_vec();

    let mut histogram = [0u32; NUM_TEMPORAL_VALUES as usize];
    for record in &db.get().temporal_index_record {
        if record.temporal_index >= NUM_TEMPORAL_VALUES {
            continue;
        }
        if record.origin_hash == origin_hash {
            if record.user_hash == user_hash {
                return record.temporal_index;
            }
            histogram[record.temporal_index as usize] += 1;
        }
    }

    let mut chosen = 0usize;
    for (index, count) in histogram.iter().enumerate() {
        if *count < histogram[chosen] {
            chosen = index;
        }
    }
    if histogram[chosen] > 0 {
        tracing::warn!(
            index = chosen,
            users = histogram[chosen],
            "temporal index pool exhausted for origin; reusing index"
        );
    }

    let temporal_index = chosen as u32;
    let mut edit = db.edit();
    edit.temporal_index_record.push(TemporalIndexRecord {
        origin_hash,
        user_hash,
        temporal_index,
    });
    if let Err(e) = edit.save() {
        tracing::warn!(error = %e, "failed to persist temporal index");
    }
    temporal_index
}
