//! MySQL/MariaDB client protocol structures and parsing.

mod packets;
mod parser;

pub use packets::{
    build_err_packet, too_many_auth_failures, ClientInfo, ClientResponse, CLIENT_CONNECT_ATTRS,
    CLIENT_CONNECT_WITH_DB, CLIENT_MYSQL, CLIENT_PLUGIN_AUTH, CLIENT_PLUGIN_AUTH_LENENC_DATA,
    CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION, CLIENT_SSL,
};
pub use parser::{parse_client_capabilities, parse_client_response};
