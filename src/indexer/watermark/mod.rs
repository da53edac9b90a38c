
use tracing::{debug, warn};

use crate::database::VectorIndex;

/// Highest log record id already present in the vector index.
///
/// Recomputed from the stored ids on every call so it can never disagree with
/// what was actually committed. Returns `None` for an empty or missing index.
/// Ids that do not parse as integers are skipped.
#[inline]
pub async fn current_watermark<V: VectorIndex + ?Sized>(index: &V) -> crate::Result<Option<i64>> {
    let ids = index.list_ids().await?;
    let watermark = max_record_id(&ids);
    debug!("Derived watermark {:?} from {} stored ids", watermark, ids.len());
    Ok(watermark)
}

/// Maximum of the ids that parse as `i64`
#[inline]
pub fn max_record_id<S: AsRef<str>>(ids: &[S]) -> Option<i64> {
    ids.iter()
        .filter_map(|id| {
            let id = id.as_ref();
            match id.parse::<i64>() {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Ignoring vector index id {:?} that is not a record id: {}", id, e);
                    None
                }
            }
        })
        .max()
}
