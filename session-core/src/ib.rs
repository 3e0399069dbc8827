use crate::types::events::{
    Event, OfflineSyncCompleted, OfflineSyncPreview, QrScannedWithoutMultidevice,
};
use wasession_binary::builder::NodeBuilder;
use wasession_binary::jid::SERVER_JID;
use wasession_binary::node::Node;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const WEEK_MS: i64 = 7 * DAY_MS;

/// Maps one child of an `ib` node to the event it announces.
///
/// `None` for children that carry nothing the session layer reports.
pub fn event_for_child(child: &Node) -> Option<Event> {
    match child.tag.as_str() {
        "downgrade_webclient" => Some(Event::QrScannedWithoutMultidevice(
            QrScannedWithoutMultidevice,
        )),
        "offline_preview" => {
            let mut attrs = child.attrs();
            let mut count = |key: &str| attrs.optional_i64(key).unwrap_or(0) as i32;
            Some(Event::OfflineSyncPreview(OfflineSyncPreview {
                total: count("count"),
                app_data_changes: count("appdata"),
                messages: count("message"),
                notifications: count("notification"),
                receipts: count("receipt"),
            }))
        }
        "offline" => Some(Event::OfflineSyncCompleted(OfflineSyncCompleted {
            count: child.attrs().optional_i64("count").unwrap_or(0) as i32,
        })),
        _ => None,
    }
}

/// Session id the server expects in `unified_session`: now plus three days,
/// folded into a one-week window.
pub fn unified_session_id(now_ms: i64) -> i64 {
    (now_ms + 3 * DAY_MS).rem_euclid(WEEK_MS)
}

pub fn build_unified_session_node(now_ms: i64) -> Node {
    NodeBuilder::new("ib")
        .attr("to", SERVER_JID)
        .children([NodeBuilder::new("unified_session")
            .attr("id", unified_session_id(now_ms).to_string())
            .build()])
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_preview_counts() {
        let child = NodeBuilder::new("offline_preview")
            .attrs([
                ("count", "12"),
                ("appdata", "1"),
                ("message", "8"),
                ("notification", "2"),
                ("receipt", "1"),
            ])
            .build();
        match event_for_child(&child) {
            Some(Event::OfflineSyncPreview(p)) => {
                assert_eq!(p.total, 12);
                assert_eq!(p.messages, 8);
                assert_eq!(p.receipts, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_child_has_no_event() {
        assert!(event_for_child(&NodeBuilder::new("dirty").build()).is_none());
    }

    #[test]
    fn test_unified_session_id_wraps_within_a_week() {
        assert_eq!(unified_session_id(0), 3 * DAY_MS);
        assert_eq!(unified_session_id(4 * DAY_MS), 0);
        let id = unified_session_id(1_760_000_000_000);
        assert!((0..WEEK_MS).contains(&id));
    }
}
