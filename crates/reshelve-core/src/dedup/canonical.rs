use super::Member;
use crate::config::MixedOriginPolicy;
use std::cmp::Ordering;

/// Total order over members of one content hash; the smallest member is the
/// canonical copy.
///
/// 1. archive-extracted vs untracked, per `policy`
/// 2. both extracted: earliest extraction wins
/// 3. newest modification time
/// 4. shortest path
/// 5. lexical path order
pub fn compare(a: &Member, b: &Member, policy: MixedOriginPolicy) -> Ordering {
    let origin = match (a.provenance.record(), b.provenance.record()) {
        (Some(_), None) => match policy {
            MixedOriginPolicy::PreferExtracted => Ordering::Less,
            MixedOriginPolicy::PreferUntracked => Ordering::Greater,
        },
        (None, Some(_)) => match policy {
            MixedOriginPolicy::PreferExtracted => Ordering::Greater,
            MixedOriginPolicy::PreferUntracked => Ordering::Less,
        },
        (Some(ra), Some(rb)) => ra.extracted_at.cmp(&rb.extracted_at),
        (None, None) => Ordering::Equal,
    };

    origin
        .then_with(|| b.record.modified.cmp(&a.record.modified))
        .then_with(|| {
            a.record
                .path
                .as_os_str()
                .len()
                .cmp(&b.record.path.as_os_str().len())
        })
        .then_with(|| a.record.path.cmp(&b.record.path))
}
