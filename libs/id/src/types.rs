//! Typed ID definitions.

use crate::define_id;

// =============================================================================
// Actors
// =============================================================================

define_id!(ActorId, "act");

// =============================================================================
// Connections
// =============================================================================

define_id!(ConnId, "conn");

// =============================================================================
// Scheduling
// =============================================================================

define_id!(ScheduledEventId, "evt");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_actor_id_roundtrip() {
        let id = ActorId::new();
        let parsed: ActorId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("act_"));
    }

    #[test]
    fn test_conn_id_rejects_actor_prefix() {
        let actor = ActorId::new().to_string();
        let err = actor.parse::<ConnId>().unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<ActorId, _> = "act01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_empty() {
        let result: Result<ScheduledEventId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<ConnId, _> = "conn_invalid".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_json_form_is_string() {
        let id = ScheduledEventId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: ScheduledEventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let first = ConnId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = ConnId::new();
        assert!(first < second);
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [ActorId::PREFIX, ConnId::PREFIX, ScheduledEventId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(s in ".{0,40}") {
            let _ = ActorId::parse(&s);
        }

        #[test]
        fn prop_from_ulid_roundtrips(raw in any::<u128>()) {
            let ulid = crate::Ulid(raw);
            let id = ActorId::from_ulid(ulid);
            prop_assert_eq!(ActorId::parse(&id.to_string()).unwrap(), id);
        }
    }
}
