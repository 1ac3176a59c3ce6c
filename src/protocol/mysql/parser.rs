//! Client handshake-response parser
//!
//! Decodes the handshake response byte stream under a given capability
//! mask. The buffer is consumed from the front as stages complete, so a
//! caller can hand the remainder to the next protocol stage. Parsing is
//! total: adversarial input yields an error, never a read past the buffer.

use super::packets::{
    ClientInfo, ClientResponse, CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_MYSQL,
    CLIENT_PLUGIN_AUTH, CLIENT_PLUGIN_AUTH_LENENC_DATA, CLIENT_SECURE_CONNECTION,
};
use crate::error::ParseError;

type Result<T> = std::result::Result<T, ParseError>;

/// Consume `len` bytes from the front of the buffer.
fn pop_front(data: &mut Vec<u8>, len: usize) {
    data.drain(..len);
}

/// Parse the 32-byte fixed capability block of a handshake response or
/// SSLRequest packet.
///
/// `old_info` carries capabilities parsed from a preceding SSLRequest, if
/// any. The capability bits are OR-merged because some connectors drop the
/// SSL capability bit in the follow-up packet sent after the TLS switch.
pub fn parse_client_capabilities(
    data: &mut Vec<u8>,
    old_info: Option<ClientInfo>,
) -> Result<ClientInfo> {
    if data.len() < 32 {
        return Err(ParseError::Truncated);
    }

    let mut info = old_info.unwrap_or_default();
    info.client_capabilities |= u32_le(&data[0..4]);

    // Next 4 bytes are the max packet size, skipped.
    info.charset = data[8];

    // 19 reserved bytes follow the charset, then 4 bytes of extra
    // capabilities. MariaDB 10.2 compatible clients clear CLIENT_MYSQL to
    // signal that the extra bits are in use.
    if info.client_capabilities & CLIENT_MYSQL == 0 {
        info.extra_capabilities |= u32_le(&data[28..32]);
    }

    pop_front(data, 32);
    Ok(info)
}

/// Parse username, auth token, default schema, plugin name and connection
/// attributes from a handshake response. The capability block must already
/// have been consumed with [`parse_client_capabilities`].
pub fn parse_client_response(data: &mut Vec<u8>, client_caps: u32) -> Result<ClientResponse> {
    let username = read_stringz(data)?;
    let auth_token = parse_auth_token(data, client_caps)?;

    let db = if client_caps & CLIENT_CONNECT_WITH_DB != 0 {
        read_stringz(data)?
    } else {
        String::new()
    };

    let plugin = if client_caps & CLIENT_PLUGIN_AUTH != 0 {
        read_stringz(data)?
    } else {
        String::new()
    };

    let attr_data = parse_attributes(data, client_caps)?;

    Ok(ClientResponse {
        username,
        auth_token,
        db,
        plugin,
        attr_data,
    })
}

/// Parse the authentication token. The length is encoded in different
/// forms depending on capabilities; pre-4.1 null-terminated tokens are not
/// supported.
fn parse_auth_token(data: &mut Vec<u8>, client_caps: u32) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(ParseError::Truncated);
    }

    let len_remaining = data.len() as u64;
    let (token_len_bytes, token_len) = if client_caps & CLIENT_PLUGIN_AUTH_LENENC_DATA != 0 {
        // Length-encoded integer, then the token data.
        let len_bytes = leint_bytes(data[0]);
        if len_bytes as u64 > len_remaining {
            return Err(ParseError::Invalid);
        }
        (len_bytes, leint_value(data))
    } else if client_caps & CLIENT_SECURE_CONNECTION != 0 {
        // One length byte, then the token data.
        (1, data[0] as u64)
    } else {
        return Err(ParseError::OldProtocol);
    };

    let total_len = (token_len_bytes as u64)
        .checked_add(token_len)
        .ok_or(ParseError::Invalid)?;
    if total_len > len_remaining {
        return Err(ParseError::Invalid);
    }

    let token = data[token_len_bytes..total_len as usize].to_vec();
    pop_front(data, total_len as usize);
    Ok(token)
}

/// Parse the connection attribute block. The data is taken verbatim,
/// length header included, as it is simply fed to backends as is.
fn parse_attributes(data: &mut Vec<u8>, client_caps: u32) -> Result<Vec<u8>> {
    if client_caps & CLIENT_CONNECT_ATTRS == 0 {
        return Ok(Vec::new());
    }
    if data.is_empty() {
        return Err(ParseError::Truncated);
    }

    let len_remaining = data.len() as u64;
    let header_bytes = leint_bytes(data[0]);
    if header_bytes as u64 > len_remaining {
        return Err(ParseError::Invalid);
    }

    let attr_len = leint_value(data);
    let total_len = (header_bytes as u64)
        .checked_add(attr_len)
        .ok_or(ParseError::Invalid)?;
    if total_len > len_remaining {
        return Err(ParseError::Invalid);
    }

    let attrs = data[..total_len as usize].to_vec();
    pop_front(data, total_len as usize);
    Ok(attrs)
}

/// Read a null-terminated string from the front of the buffer.
fn read_stringz(data: &mut Vec<u8>) -> Result<String> {
    let nul = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(ParseError::Truncated)?;
    let s = String::from_utf8_lossy(&data[..nul]).into_owned();
    pop_front(data, nul + 1);
    Ok(s)
}

fn u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

/// Width of a length-encoded integer, from its first byte.
fn leint_bytes(first: u8) -> usize {
    match first {
        0xfc => 3,
        0xfd => 4,
        0xfe => 9,
        _ => 1,
    }
}

/// Value of a length-encoded integer. The caller has checked that the
/// buffer holds `leint_bytes` bytes.
fn leint_value(data: &[u8]) -> u64 {
    match data[0] {
        0xfc => u16::from_le_bytes([data[1], data[2]]) as u64,
        0xfd => u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64,
        0xfe => u64::from_le_bytes([
            data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
        ]),
        b => b as u64,
    }
}
