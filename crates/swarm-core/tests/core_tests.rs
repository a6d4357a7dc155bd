#[cfg(test)]
mod tests {
    use swarm_core::*;

    // ── Role tests ─────────────────────────────────────────────

    #[test]
    fn test_role_wire_names() {
        assert_eq!(
            serde_json::to_string(&Role::Coordinator).unwrap(),
            "\"COORD\""
        );
        assert_eq!(serde_json::to_string(&Role::Peer).unwrap(), "\"PEER\"");
        let restored: Role = serde_json::from_str("\"COORD\"").unwrap();
        assert_eq!(restored, Role::Coordinator);
    }

    #[test]
    fn test_role_parse_lossy() {
        assert_eq!(Role::parse_lossy("COORD"), Role::Coordinator);
        assert_eq!(Role::parse_lossy("PEER"), Role::Peer);
        assert_eq!(Role::parse_lossy("coord"), Role::Peer);
        assert_eq!(Role::parse_lossy(""), Role::Peer);
    }

    #[test]
    fn test_role_default_is_peer() {
        assert_eq!(Role::default(), Role::Peer);
        assert_eq!(Role::Coordinator.to_string(), "COORD");
    }

    // ── Node naming ────────────────────────────────────────────

    #[test]
    fn test_node_name_uses_last_four_hex_digits() {
        assert_eq!(node_name(0xDEADBEEF), "NBEEF");
        assert_eq!(node_name(0x1a2b3c), "N2B3C");
    }

    #[test]
    fn test_node_name_short_ids() {
        assert_eq!(node_name(10), "NA");
        assert_eq!(node_name(0), "N0");
    }

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_error_display() {
        let err = SwarmError::Config("bad interval".into());
        assert!(err.to_string().contains("bad interval"));
    }

    #[test]
    fn test_error_invalid_address() {
        let err = SwarmError::InvalidAddress {
            addr: "nope".into(),
            reason: "not a multiaddr".into(),
        };
        let s = err.to_string();
        assert!(s.contains("nope"));
        assert!(s.contains("not a multiaddr"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SwarmError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    // ── Event Bus tests ────────────────────────────────────────

    #[test]
    fn test_event_bus_pub_sub() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(Event::Shutdown);

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, Event::Shutdown));
    }

    #[test]
    fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(Event::PeerDropped { node_id: 7 });

        assert_eq!(rx1.try_recv().unwrap(), Event::PeerDropped { node_id: 7 });
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_event_bus_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(Event::Shutdown);
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = Event::RoleChanged {
            from: Role::Peer,
            to: Role::Coordinator,
            coordinator_id: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"role_changed\""));
        let restored: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, event);
    }
}
