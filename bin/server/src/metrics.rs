use metrics::{describe_counter, describe_gauge, describe_histogram};

// this is for ssh connection counting
pub const METRICS_SSH_CONN_LIVE: &str = "ssh_tunnel_conn_live";
pub const METRICS_SSH_CONN_COUNT: &str = "ssh_tunnel_conn_count";
pub const METRICS_SSH_HANDSHAKE_ERROR_COUNT: &str = "ssh_tunnel_handshake_error_count";
pub const METRICS_SSH_AUTH_REJECT_COUNT: &str = "ssh_tunnel_auth_reject_count";

// this is for direct-tcpip channels (outgoing)
pub const METRICS_OUTBOUND_LIVE: &str = "ssh_tunnel_outbound_live";
pub const METRICS_OUTBOUND_COUNT: &str = "ssh_tunnel_outbound_count";
pub const METRICS_OUTBOUND_REJECT_COUNT: &str = "ssh_tunnel_outbound_reject_count";
pub const METRICS_OUTBOUND_DIAL_HISTOGRAM: &str = "ssh_tunnel_outbound_dial_histogram";

// this is for tcpip-forward listeners and their connections (incoming)
pub const METRICS_REVERSE_LISTENER_LIVE: &str = "ssh_tunnel_reverse_listener_live";
pub const METRICS_REVERSE_CONN_LIVE: &str = "ssh_tunnel_reverse_conn_live";
pub const METRICS_REVERSE_CONN_COUNT: &str = "ssh_tunnel_reverse_conn_count";
pub const METRICS_REVERSE_OPEN_ERROR_COUNT: &str = "ssh_tunnel_reverse_open_error_count";

// this is for bridged bytes
pub const METRICS_BRIDGE_BYTES: &str = "ssh_tunnel_bridge_bytes";

// this is for dns relay
pub const METRICS_DNS_QUERY_COUNT: &str = "ssh_tunnel_dns_query_count";
pub const METRICS_DNS_LOOKUP_ERROR_COUNT: &str = "ssh_tunnel_dns_lookup_error_count";

pub fn describe_metrics() {
    // this is for ssh connection counting
    describe_gauge!(METRICS_SSH_CONN_LIVE, "Live ssh connections");
    describe_counter!(METRICS_SSH_CONN_COUNT, "Number of accepted ssh connections");
    describe_counter!(METRICS_SSH_HANDSHAKE_ERROR_COUNT, "Number of ssh connections failed before a session was running");
    describe_counter!(METRICS_SSH_AUTH_REJECT_COUNT, "Number of rejected public keys");

    // this is for direct-tcpip channels (outgoing)
    describe_gauge!(METRICS_OUTBOUND_LIVE, "Live outbound tunnels");
    describe_counter!(METRICS_OUTBOUND_COUNT, "Number of outbound tunnels");
    describe_counter!(METRICS_OUTBOUND_REJECT_COUNT, "Number of rejected outbound channel opens");
    describe_histogram!(METRICS_OUTBOUND_DIAL_HISTOGRAM, "Outbound dial latency histogram");

    // this is for tcpip-forward listeners and their connections (incoming)
    describe_gauge!(METRICS_REVERSE_LISTENER_LIVE, "Live reverse forward listeners");
    describe_gauge!(METRICS_REVERSE_CONN_LIVE, "Live reverse forwarded connections");
    describe_counter!(METRICS_REVERSE_CONN_COUNT, "Number of reverse forwarded connections");
    describe_counter!(METRICS_REVERSE_OPEN_ERROR_COUNT, "Number of forwarded channel opens refused by the client");

    describe_counter!(METRICS_BRIDGE_BYTES, "Bytes relayed by bridges");

    // this is for dns relay
    describe_counter!(METRICS_DNS_QUERY_COUNT, "Number of dns queries received");
    describe_counter!(METRICS_DNS_LOOKUP_ERROR_COUNT, "Number of failed dns lookups");
}
