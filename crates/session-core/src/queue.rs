//! ActivityQueuer: defers resource activities until the receiving side
//! has the reference point ready.
//!
//! While a reference point is still being transferred (invitation,
//! project negotiation), activities touching it must not reach local
//! consumers: the copy they would be applied to does not exist yet.
//! Queuing is reference counted: nested callers each call
//! `enable_queuing`, and the buffer becomes eligible for flush only
//! once every one of them has called `disable_queuing`. The flush
//! itself happens on the next `process` call.
//!
//! On flush, a synthetic `Editor(Activated)` is injected per distinct
//! (document, author) pair ahead of its first edit-related activity.
//! The consumer's per-user shadow state is initialized by activations,
//! and the real activation may have been sent before this side was
//! listening: without the synthetic one, every buffered edit for that
//! pair would be dropped on the floor.

use crate::activity::{Activity, EditorAction, ResourcePath};
use crate::participant::ParticipantId;
use crate::reference_point::ReferencePoint;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, warn};

struct QueueEntry {
    buffer: Vec<Activity>,
    /// Outstanding `enable_queuing` calls; 0 means ready to flush.
    refcount: usize,
}

/// Reference-counted per-reference-point activity buffer.
///
/// All operations are non-panicking and safe under concurrent callers.
pub struct ActivityQueuer {
    entries: Mutex<HashMap<ReferencePoint, QueueEntry>>,
}

impl ActivityQueuer {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or nest) queuing for a reference point.
    ///
    /// Every call must eventually be balanced by one `disable_queuing`
    /// call (e.g. at the end of an invitation), or the entry leaks and
    /// its activities are withheld forever.
    pub fn enable_queuing(&self, point: &ReferencePoint) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(point.clone()).or_insert_with(|| QueueEntry {
            buffer: Vec::new(),
            refcount: 0,
        });
        entry.refcount += 1;
        debug!(point = %point, refcount = entry.refcount, "Queuing enabled");
    }

    /// Release one level of queuing for a reference point.
    ///
    /// Does not flush; the buffered activities are released by the next
    /// `process` call once the count reaches zero. Calls beyond the
    /// matching number of `enable_queuing` calls are no-ops.
    pub fn disable_queuing(&self, point: &ReferencePoint) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(point) {
            Some(entry) if entry.refcount > 0 => {
                entry.refcount -= 1;
                debug!(point = %point, refcount = entry.refcount, "Queuing disabled");
            }
            _ => {
                warn!(point = %point, "disable_queuing without matching enable_queuing ignored");
            }
        }
    }

    /// Run one batch through the queuer.
    ///
    /// Flushes every entry whose count has reached zero (buffered
    /// activities first, in buffer order, with synthetic activations
    /// injected), then routes the new batch: activities for a still
    /// actively queued point are buffered, everything else passes
    /// through in its original relative order.
    pub fn process(&self, activities: Vec<Activity>) -> Vec<Activity> {
        let mut entries = self.entries.lock().unwrap();
        if entries.is_empty() {
            return activities;
        }

        let mut result = Vec::new();

        let ready: Vec<ReferencePoint> = entries
            .iter()
            .filter(|(_, e)| e.refcount == 0)
            .map(|(p, _)| p.clone())
            .collect();
        for point in ready {
            let entry = entries.remove(&point).expect("collected above");
            debug!(point = %point, buffered = entry.buffer.len(), "Flushing queued activities");
            flush_with_activations(entry.buffer, &mut result);
        }

        for activity in activities {
            let queued_point = match activity.resource() {
                Some(resource)
                    if entries
                        .get(&resource.reference_point)
                        .is_some_and(|e| e.refcount > 0) =>
                {
                    Some(resource.reference_point.clone())
                }
                _ => None,
            };
            match queued_point {
                Some(point) => entries
                    .get_mut(&point)
                    .expect("checked above")
                    .buffer
                    .push(activity),
                None => result.push(activity),
            }
        }

        result
    }
}

impl Default for ActivityQueuer {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain a buffer into `result`, injecting one `Editor(Activated)` per
/// (document, author) pair ahead of its first edit-related activity
/// unless an activation for the pair was already seen in the buffer.
fn flush_with_activations(buffer: Vec<Activity>, result: &mut Vec<Activity>) {
    let mut activated: HashSet<(ResourcePath, ParticipantId)> = HashSet::new();

    for activity in buffer {
        match &activity {
            Activity::Editor {
                source,
                resource,
                action: EditorAction::Activated,
            } => {
                activated.insert((resource.clone(), source.clone()));
            }
            _ if activity.is_edit_related() => {
                let resource = activity.resource().expect("edit-related implies resource");
                let key = (resource.clone(), activity.source().clone());
                if !activated.contains(&key) {
                    debug!(resource = %key.0, author = %key.1, "Injecting synthetic editor activation");
                    result.push(Activity::Editor {
                        source: key.1.clone(),
                        resource: key.0.clone(),
                        action: EditorAction::Activated,
                    });
                    activated.insert(key);
                }
            }
            _ => {}
        }
        result.push(activity);
    }
}
