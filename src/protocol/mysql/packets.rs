//! MySQL packet structures and capability flags
//!
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

/// Set by clients speaking the plain MySQL capability scheme. MariaDB 10.2
/// compatible clients clear this bit to signal that the last 4 filler bytes
/// of the handshake response carry extended capabilities.
pub const CLIENT_MYSQL: u32 = 0x0000_0001;
/// Client specifies a default schema in the handshake response
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
/// 4.1 protocol
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
/// Client wants to switch to TLS
pub const CLIENT_SSL: u32 = 0x0000_0800;
/// 4.1+ authentication: auth token is length-prefixed
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
/// Client sends the auth plugin name
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
/// Client sends connection attributes
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
/// Auth token is a length-encoded string
pub const CLIENT_PLUGIN_AUTH_LENENC_DATA: u32 = 0x0020_0000;

/// Client capability information accumulated during the connection phase.
///
/// An SSLRequest packet carries the same leading 32 bytes as the full
/// handshake response; capabilities parsed from it are OR-merged with the
/// bits of the later packet so that a client dropping the SSL bit
/// mid-authentication does not lose it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Standard client capability bits
    pub client_capabilities: u32,
    /// MariaDB extended capability bits (valid when `CLIENT_MYSQL` unset)
    pub extra_capabilities: u32,
    /// Connection character set
    pub charset: u8,
}

/// Decoded client handshake response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientResponse {
    /// Client username
    pub username: String,
    /// Authentication token, consumed by the auth plugin
    pub auth_token: Vec<u8>,
    /// Requested default schema, empty if none
    pub db: String,
    /// Auth plugin named by the client, empty if none
    pub plugin: String,
    /// Connection attribute block, verbatim including its length header.
    /// Forwarded to backends as is.
    pub attr_data: Vec<u8>,
}

/// Build an ERR packet payload.
pub fn build_err_packet(error_code: u16, sql_state: &[u8; 5], message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9 + message.len());
    payload.push(0xFF);
    payload.extend_from_slice(&error_code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(sql_state);
    payload.extend_from_slice(message.as_bytes());
    payload
}

/// ERR packet sent when a client host has accumulated too many recent
/// authentication failures.
pub fn too_many_auth_failures(host: &str) -> Vec<u8> {
    let message = format!(
        "Host '{host}' is temporarily blocked due to too many authentication failures."
    );
    build_err_packet(1129, b"HY000", &message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_err_packet_layout() {
        let payload = build_err_packet(1045, b"28000", "Access denied");
        assert_eq!(payload[0], 0xFF);
        assert_eq!(u16::from_le_bytes([payload[1], payload[2]]), 1045);
        assert_eq!(payload[3], b'#');
        assert_eq!(&payload[4..9], b"28000");
        assert_eq!(&payload[9..], b"Access denied");
    }

    #[test]
    fn test_host_blocked_packet() {
        let payload = too_many_auth_failures("10.0.0.7");
        assert_eq!(u16::from_le_bytes([payload[1], payload[2]]), 1129);
        assert_eq!(&payload[4..9], b"HY000");
        let message = std::str::from_utf8(&payload[9..]).unwrap();
        assert_eq!(
            message,
            "Host '10.0.0.7' is temporarily blocked due to too many authentication failures."
        );
    }
}
