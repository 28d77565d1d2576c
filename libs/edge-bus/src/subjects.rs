//! Canonical subject names
//!
//! All subjects share the `connectivity.` prefix. Builders live here so
//! services never format subject strings by hand.

/// Subject prefix for the connectivity domain
pub const PREFIX: &str = "connectivity";

/// Declarative connection configuration events (upsert/delete)
pub fn config_v1() -> String {
    format!("{}.config.v1", PREFIX)
}

/// Tag metadata change notifications
pub fn tags_changed_v1() -> String {
    format!("{}.tags.changed.v1", PREFIX)
}

/// Per-connection status updates
pub fn status_v1(connection_id: &str) -> String {
    format!("{}.status.v1.{}", PREFIX, connection_id)
}

/// Per-connection raw telemetry
pub fn telemetry_raw(connection_id: &str) -> String {
    format!("{}.telemetry.raw.{}", PREFIX, connection_id)
}

/// Per-connection write requests
pub fn telemetry_write_v1(connection_id: &str) -> String {
    format!("{}.telemetry.write.v1.{}", PREFIX, connection_id)
}

/// Pattern covering write requests for all connections
pub fn telemetry_write_v1_pattern() -> String {
    format!("{}.telemetry.write.v1.*", PREFIX)
}

/// EIP discovery RPC subject for one connection
pub fn rpc_eip(connection_id: &str) -> String {
    format!("{}.rpc.eip.{}", PREFIX, connection_id)
}

/// OPC UA browse/attributes RPC subject for one connection
pub fn rpc_opcua(connection_id: &str) -> String {
    format!("{}.rpc.opcua.{}", PREFIX, connection_id)
}

/// Extract the connection id from a per-connection subject
///
/// Returns None when the subject does not carry a trailing id segment.
pub fn connection_id_of(subject: &str) -> Option<&str> {
    let tail = subject.rsplit('.').next()?;
    if tail.is_empty() || tail == "v1" {
        None
    } else {
        Some(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_shapes() {
        assert_eq!(config_v1(), "connectivity.config.v1");
        assert_eq!(status_v1("plc-1"), "connectivity.status.v1.plc-1");
        assert_eq!(
            telemetry_write_v1("broker-2"),
            "connectivity.telemetry.write.v1.broker-2"
        );
        assert_eq!(rpc_eip("cell-3"), "connectivity.rpc.eip.cell-3");
    }

    #[test]
    fn test_connection_id_extraction() {
        assert_eq!(
            connection_id_of("connectivity.telemetry.write.v1.plc-1"),
            Some("plc-1")
        );
        assert_eq!(connection_id_of("connectivity.config.v1"), None);
    }
}
