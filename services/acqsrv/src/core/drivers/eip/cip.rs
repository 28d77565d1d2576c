//! EtherNet/IP encapsulation and CIP codec
//!
//! Implements the subset the driver needs: session registration,
//! SendRRData with unconnected messaging, Read/Write Tag services,
//! Multiple Service Packet batching, Symbol Object instance enumeration
//! for tag lists, and ListIdentity. Encapsulation and CIP payloads are
//! little-endian throughout.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use edge_model::Value;

use crate::error::{AcqError, Result};

// Encapsulation commands
const CMD_LIST_IDENTITY: u16 = 0x0063;
const CMD_REGISTER_SESSION: u16 = 0x0065;
const CMD_UNREGISTER_SESSION: u16 = 0x0066;
const CMD_SEND_RR_DATA: u16 = 0x006F;

// CIP services
const SVC_MULTIPLE_SERVICE: u8 = 0x0A;
const SVC_READ_TAG: u8 = 0x4C;
const SVC_WRITE_TAG: u8 = 0x4D;
const SVC_GET_INSTANCE_ATTR_LIST: u8 = 0x55;
const SVC_UNCONNECTED_SEND: u8 = 0x52;

// CIP general status codes
const STATUS_OK: u8 = 0x00;
const STATUS_PARTIAL: u8 = 0x06;

const ENCAP_HEADER_LEN: usize = 24;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// CIP elementary types
// ============================================================================

/// CIP elementary type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipType(pub u16);

impl CipType {
    pub const BOOL: CipType = CipType(0x00C1);
    pub const SINT: CipType = CipType(0x00C2);
    pub const INT: CipType = CipType(0x00C3);
    pub const DINT: CipType = CipType(0x00C4);
    pub const LINT: CipType = CipType(0x00C5);
    pub const USINT: CipType = CipType(0x00C6);
    pub const UINT: CipType = CipType(0x00C7);
    pub const UDINT: CipType = CipType(0x00C8);
    pub const REAL: CipType = CipType(0x00CA);
    pub const LREAL: CipType = CipType(0x00CB);

    pub fn name(self) -> &'static str {
        match self {
            CipType::BOOL => "BOOL",
            CipType::SINT => "SINT",
            CipType::INT => "INT",
            CipType::DINT => "DINT",
            CipType::LINT => "LINT",
            CipType::USINT => "USINT",
            CipType::UINT => "UINT",
            CipType::UDINT => "UDINT",
            CipType::REAL => "REAL",
            CipType::LREAL => "LREAL",
            _ => "UNKNOWN",
        }
    }
}

/// Decode a typed CIP value from its wire bytes
pub fn decode_cip_value(cip_type: CipType, data: &[u8]) -> Option<Value> {
    match cip_type {
        CipType::BOOL => Some(Value::Bool(*data.first()? != 0)),
        CipType::SINT => Some(Value::Int(*data.first()? as i8 as i64)),
        CipType::USINT => Some(Value::Int(*data.first()? as i64)),
        CipType::INT => Some(Value::Int(i16::from_le_bytes(
            data.get(..2)?.try_into().ok()?,
        ) as i64)),
        CipType::UINT => Some(Value::Int(u16::from_le_bytes(
            data.get(..2)?.try_into().ok()?,
        ) as i64)),
        CipType::DINT => Some(Value::Int(i32::from_le_bytes(
            data.get(..4)?.try_into().ok()?,
        ) as i64)),
        CipType::UDINT => Some(Value::Int(u32::from_le_bytes(
            data.get(..4)?.try_into().ok()?,
        ) as i64)),
        CipType::LINT => Some(Value::Int(i64::from_le_bytes(
            data.get(..8)?.try_into().ok()?,
        ))),
        CipType::REAL => Some(Value::Float(f32::from_le_bytes(
            data.get(..4)?.try_into().ok()?,
        ) as f64)),
        CipType::LREAL => Some(Value::Float(f64::from_le_bytes(
            data.get(..8)?.try_into().ok()?,
        ))),
        _ => None,
    }
}

/// Encode a value for a Write Tag request
pub fn encode_cip_value(cip_type: CipType, value: &Value) -> Option<Vec<u8>> {
    let number = value.as_f64();
    match cip_type {
        CipType::BOOL => Some(vec![if number? != 0.0 { 0xFF } else { 0x00 }]),
        CipType::SINT | CipType::USINT => Some(vec![number? as i64 as u8]),
        CipType::INT | CipType::UINT => Some((number? as i64 as i16).to_le_bytes().to_vec()),
        CipType::DINT | CipType::UDINT => Some((number? as i64 as i32).to_le_bytes().to_vec()),
        CipType::LINT => Some((number? as i64).to_le_bytes().to_vec()),
        CipType::REAL => Some((number? as f32).to_le_bytes().to_vec()),
        CipType::LREAL => Some(number?.to_le_bytes().to_vec()),
        _ => None,
    }
}

// ============================================================================
// Path building
// ============================================================================

/// Symbolic EPATH for a tag name, padded to an even byte count
pub fn symbolic_path(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut path = Vec::with_capacity(2 + bytes.len() + 1);
    path.push(0x91); // ANSI extended symbolic segment
    path.push(bytes.len() as u8);
    path.extend_from_slice(bytes);
    if path.len() % 2 != 0 {
        path.push(0x00);
    }
    path
}

/// Logical EPATH: class + 16-bit instance
fn class_instance_path(class: u8, instance: u16) -> Vec<u8> {
    vec![
        0x20,
        class,
        0x25,
        0x00,
        (instance & 0xFF) as u8,
        (instance >> 8) as u8,
    ]
}

/// Build a CIP request: service, path size in words, path, data
pub fn build_request(service: u8, path: &[u8], data: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(2 + path.len() + data.len());
    request.push(service);
    request.push((path.len() / 2) as u8);
    request.extend_from_slice(path);
    request.extend_from_slice(data);
    request
}

/// A parsed CIP response
#[derive(Debug, Clone)]
pub struct CipResponse {
    pub service: u8,
    pub status: u8,
    pub data: Vec<u8>,
}

impl CipResponse {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn is_partial(&self) -> bool {
        self.status == STATUS_PARTIAL
    }
}

/// Parse a message-router response: reply service, reserved, general
/// status, additional-status size, additional status words, data
pub fn parse_response(body: &[u8]) -> Result<CipResponse> {
    if body.len() < 4 {
        return Err(AcqError::protocol("CIP: short response".to_string()));
    }
    let additional_words = body[3] as usize;
    let data_start = 4 + additional_words * 2;
    if body.len() < data_start {
        return Err(AcqError::protocol("CIP: truncated status".to_string()));
    }
    Ok(CipResponse {
        service: body[0] & 0x7F,
        status: body[2],
        data: body[data_start..].to_vec(),
    })
}

// ============================================================================
// Multiple Service Packet
// ============================================================================

/// Pack embedded requests into a Multiple Service Packet body
pub fn build_multiple_service(requests: &[Vec<u8>]) -> Vec<u8> {
    let count = requests.len() as u16;
    let mut data = Vec::new();
    data.extend_from_slice(&count.to_le_bytes());
    // Offsets are measured from the count field
    let mut offset = 2 + 2 * requests.len();
    for request in requests {
        data.extend_from_slice(&(offset as u16).to_le_bytes());
        offset += request.len();
    }
    for request in requests {
        data.extend_from_slice(request);
    }
    data
}

/// Split a Multiple Service Packet response into embedded responses
pub fn split_multiple_service(data: &[u8]) -> Result<Vec<CipResponse>> {
    if data.len() < 2 {
        return Err(AcqError::protocol("MSP: short response".to_string()));
    }
    let count = u16::from_le_bytes([data[0], data[1]]) as usize;
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        let at = 2 + i * 2;
        let offset = data
            .get(at..at + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .ok_or_else(|| AcqError::protocol("MSP: truncated offsets".to_string()))?;
        offsets.push(offset);
    }
    let mut responses = Vec::with_capacity(count);
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(data.len());
        let body = data
            .get(start..end)
            .ok_or_else(|| AcqError::protocol("MSP: bad offset".to_string()))?;
        responses.push(parse_response(body)?);
    }
    Ok(responses)
}

// ============================================================================
// Tag list entries
// ============================================================================

/// One entry from Symbol Object enumeration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EipTagInfo {
    pub instance: u32,
    pub name: String,
    /// Raw symbol type word
    pub symbol_type: u16,
    /// Friendly name of the elementary type, "UNKNOWN" for structures
    pub type_name: String,
}

/// Device identity from ListIdentity
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EipIdentity {
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub revision: String,
    pub serial: u32,
    pub product_name: String,
}

// ============================================================================
// Client
// ============================================================================

/// A registered EtherNet/IP session
pub struct EipClient {
    stream: TcpStream,
    session: u32,
    slot: u8,
}

impl EipClient {
    pub async fn connect(host: &str, port: u16, slot: u8) -> Result<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| AcqError::timeout(format!("EIP connect to {}:{}", host, port)))?
            .map_err(|e| AcqError::transport(format!("EIP connect {}:{}: {}", host, port, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| AcqError::transport(e.to_string()))?;

        let mut client = Self {
            stream,
            session: 0,
            slot,
        };
        client.register_session().await?;
        debug!("EIP session 0x{:08X} up ({}:{})", client.session, host, port);
        Ok(client)
    }

    async fn register_session(&mut self) -> Result<()> {
        // Protocol version 1, options 0
        let data = [0x01, 0x00, 0x00, 0x00];
        let (header, _) = self.encap_exchange(CMD_REGISTER_SESSION, &data).await?;
        self.session = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if self.session == 0 {
            return Err(AcqError::transport("EIP: session refused".to_string()));
        }
        Ok(())
    }

    /// Polite session teardown; best-effort
    pub async fn unregister(&mut self) {
        let _ = self.encap_send(CMD_UNREGISTER_SESSION, &[]).await;
    }

    /// Read one tag; returns (type, raw value bytes)
    pub async fn read_tag(&mut self, name: &str) -> Result<(CipType, Vec<u8>)> {
        let request = build_request(SVC_READ_TAG, &symbolic_path(name), &1u16.to_le_bytes());
        let response = self.unconnected_request(&request).await?;
        if !response.is_ok() {
            return Err(AcqError::protocol(format!(
                "Read '{}' failed: CIP status 0x{:02X}",
                name, response.status
            )));
        }
        split_typed_value(&response.data)
    }

    /// Read several tags in one Multiple Service Packet
    ///
    /// Returns per-tag results in request order.
    pub async fn read_tags(&mut self, names: &[String]) -> Result<Vec<Result<(CipType, Vec<u8>)>>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let embedded: Vec<Vec<u8>> = names
            .iter()
            .map(|name| build_request(SVC_READ_TAG, &symbolic_path(name), &1u16.to_le_bytes()))
            .collect();
        let msp = build_request(
            SVC_MULTIPLE_SERVICE,
            &class_instance_path(0x02, 1),
            &build_multiple_service(&embedded),
        );
        let response = self.unconnected_request(&msp).await?;
        if !response.is_ok() && !response.is_partial() {
            return Err(AcqError::protocol(format!(
                "MSP failed: CIP status 0x{:02X}",
                response.status
            )));
        }
        let inner = split_multiple_service(&response.data)?;
        if inner.len() != names.len() {
            return Err(AcqError::protocol(format!(
                "MSP: {} responses for {} requests",
                inner.len(),
                names.len()
            )));
        }
        Ok(inner
            .into_iter()
            .zip(names)
            .map(|(resp, name)| {
                if resp.is_ok() {
                    split_typed_value(&resp.data)
                } else {
                    Err(AcqError::protocol(format!(
                        "Read '{}' failed: CIP status 0x{:02X}",
                        name, resp.status
                    )))
                }
            })
            .collect())
    }

    /// Write one tag with an explicit CIP type
    pub async fn write_tag(&mut self, name: &str, cip_type: CipType, value: &Value) -> Result<()> {
        let bytes = encode_cip_value(cip_type, value).ok_or_else(|| {
            AcqError::tag(format!("Cannot encode {} as {}", value, cip_type.name()))
        })?;
        let mut data = Vec::with_capacity(4 + bytes.len());
        data.extend_from_slice(&cip_type.0.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&bytes);
        let request = build_request(SVC_WRITE_TAG, &symbolic_path(name), &data);
        let response = self.unconnected_request(&request).await?;
        if !response.is_ok() {
            return Err(AcqError::protocol(format!(
                "Write '{}' failed: CIP status 0x{:02X}",
                name, response.status
            )));
        }
        Ok(())
    }

    /// Enumerate controller tags starting from a Symbol Object instance
    ///
    /// Returns the entries of this page and the next start instance when
    /// the transfer is partial.
    pub async fn list_tags(&mut self, start_instance: u32) -> Result<(Vec<EipTagInfo>, Option<u32>)> {
        // Attributes: 1 = symbol name, 2 = symbol type
        let data = [0x02, 0x00, 0x01, 0x00, 0x02, 0x00];
        let request = build_request(
            SVC_GET_INSTANCE_ATTR_LIST,
            &class_instance_path(0x6B, start_instance as u16),
            &data,
        );
        let response = self.unconnected_request(&request).await?;
        if !response.is_ok() && !response.is_partial() {
            return Err(AcqError::protocol(format!(
                "Tag list failed: CIP status 0x{:02X}",
                response.status
            )));
        }

        let mut tags = Vec::new();
        let mut cursor = 0usize;
        let data = &response.data;
        let mut last_instance = start_instance;
        while cursor + 4 <= data.len() {
            let instance = u32::from_le_bytes(data[cursor..cursor + 4].try_into().unwrap_or_default());
            cursor += 4;
            let Some(len_bytes) = data.get(cursor..cursor + 2) else { break };
            let name_len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
            cursor += 2;
            let Some(name_bytes) = data.get(cursor..cursor + name_len) else { break };
            let name = String::from_utf8_lossy(name_bytes).to_string();
            cursor += name_len;
            let Some(type_bytes) = data.get(cursor..cursor + 2) else { break };
            let symbol_type = u16::from_le_bytes([type_bytes[0], type_bytes[1]]);
            cursor += 2;

            last_instance = instance;
            let type_name = CipType(symbol_type & 0x0FFF).name().to_string();
            tags.push(EipTagInfo {
                instance,
                name,
                symbol_type,
                type_name,
            });
        }

        let next = response.is_partial().then_some(last_instance + 1);
        Ok((tags, next))
    }

    /// ListIdentity over the registered session's transport
    pub async fn identify(&mut self) -> Result<EipIdentity> {
        let (_, body) = self.encap_exchange(CMD_LIST_IDENTITY, &[]).await?;
        // CPF: item count, then identity item (type 0x000C)
        if body.len() < 2 {
            return Err(AcqError::protocol("ListIdentity: empty".to_string()));
        }
        let mut cursor = 2usize;
        // Skip the item type and length fields
        let item = body
            .get(cursor + 4..)
            .ok_or_else(|| AcqError::protocol("ListIdentity: short item".to_string()))?;
        cursor = 0;
        // encap version (2) + sockaddr (16)
        cursor += 18;
        let field = |at: usize| -> Result<u16> {
            item.get(at..at + 2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .ok_or_else(|| AcqError::protocol("ListIdentity: truncated".to_string()))
        };
        let vendor_id = field(cursor)?;
        let device_type = field(cursor + 2)?;
        let product_code = field(cursor + 4)?;
        let rev_major = *item.get(cursor + 6).unwrap_or(&0);
        let rev_minor = *item.get(cursor + 7).unwrap_or(&0);
        // status (2)
        let serial = item
            .get(cursor + 10..cursor + 14)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);
        let name_len = *item.get(cursor + 14).unwrap_or(&0) as usize;
        let product_name = item
            .get(cursor + 15..cursor + 15 + name_len)
            .map(|b| String::from_utf8_lossy(b).to_string())
            .unwrap_or_default();

        Ok(EipIdentity {
            vendor_id,
            device_type,
            product_code,
            revision: format!("{}.{}", rev_major, rev_minor),
            serial,
            product_name,
        })
    }

    // ========================================================================
    // Unconnected messaging
    // ========================================================================

    /// Wrap a request in Unconnected Send routed to the configured slot
    /// and exchange it via SendRRData
    async fn unconnected_request(&mut self, request: &[u8]) -> Result<CipResponse> {
        let mut send_data = Vec::with_capacity(request.len() + 12);
        send_data.push(0x0A); // priority / time tick
        send_data.push(0x0F); // timeout ticks
        send_data.extend_from_slice(&(request.len() as u16).to_le_bytes());
        send_data.extend_from_slice(request);
        if request.len() % 2 != 0 {
            send_data.push(0x00);
        }
        send_data.push(0x01); // route path size in words
        send_data.push(0x00); // reserved
        send_data.push(0x01); // port 1 (backplane)
        send_data.push(self.slot);

        let unconnected = build_request(
            SVC_UNCONNECTED_SEND,
            &class_instance_path(0x06, 1),
            &send_data,
        );

        // SendRRData: interface handle, timeout, CPF with null address +
        // unconnected data item
        let mut body = Vec::with_capacity(unconnected.len() + 16);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&10u16.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes()); // item count
        body.extend_from_slice(&0x0000u16.to_le_bytes()); // null address item
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0x00B2u16.to_le_bytes()); // unconnected data
        body.extend_from_slice(&(unconnected.len() as u16).to_le_bytes());
        body.extend_from_slice(&unconnected);

        let (_, response_body) = self.encap_exchange(CMD_SEND_RR_DATA, &body).await?;

        // Response: interface handle (4) + timeout (2) + CPF
        let cpf = response_body
            .get(6..)
            .ok_or_else(|| AcqError::protocol("SendRRData: short response".to_string()))?;
        if cpf.len() < 2 {
            return Err(AcqError::protocol("SendRRData: no CPF".to_string()));
        }
        let item_count = u16::from_le_bytes([cpf[0], cpf[1]]) as usize;
        let mut cursor = 2usize;
        for _ in 0..item_count {
            let item_type = cpf
                .get(cursor..cursor + 2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .ok_or_else(|| AcqError::protocol("CPF: truncated".to_string()))?;
            let item_len = cpf
                .get(cursor + 2..cursor + 4)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
                .ok_or_else(|| AcqError::protocol("CPF: truncated".to_string()))?;
            let item_data = cpf
                .get(cursor + 4..cursor + 4 + item_len)
                .ok_or_else(|| AcqError::protocol("CPF: truncated item".to_string()))?;
            if item_type == 0x00B2 {
                return parse_response(item_data);
            }
            cursor += 4 + item_len;
        }
        Err(AcqError::protocol("SendRRData: no data item".to_string()))
    }

    // ========================================================================
    // Encapsulation framing
    // ========================================================================

    async fn encap_send(&mut self, command: u16, data: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(ENCAP_HEADER_LEN + data.len());
        frame.extend_from_slice(&command.to_le_bytes());
        frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
        frame.extend_from_slice(&self.session.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes()); // status
        frame.extend_from_slice(&[0u8; 8]); // sender context
        frame.extend_from_slice(&0u32.to_le_bytes()); // options
        frame.extend_from_slice(data);
        tokio::time::timeout(IO_TIMEOUT, self.stream.write_all(&frame))
            .await
            .map_err(|_| AcqError::timeout("EIP write".to_string()))?
            .map_err(|e| AcqError::transport(format!("EIP send: {}", e)))?;
        Ok(())
    }

    /// Send a command and read its reply; returns (header, body)
    async fn encap_exchange(&mut self, command: u16, data: &[u8]) -> Result<([u8; 24], Vec<u8>)> {
        self.encap_send(command, data).await?;

        let mut header = [0u8; ENCAP_HEADER_LEN];
        tokio::time::timeout(IO_TIMEOUT, self.stream.read_exact(&mut header))
            .await
            .map_err(|_| AcqError::timeout("EIP read".to_string()))?
            .map_err(|e| AcqError::transport(format!("EIP recv: {}", e)))?;

        let status = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if status != 0 {
            return Err(AcqError::protocol(format!(
                "EIP encapsulation status 0x{:08X}",
                status
            )));
        }
        let body_len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; body_len];
        tokio::time::timeout(IO_TIMEOUT, self.stream.read_exact(&mut body))
            .await
            .map_err(|_| AcqError::timeout("EIP read".to_string()))?
            .map_err(|e| AcqError::transport(format!("EIP recv: {}", e)))?;
        Ok((header, body))
    }
}

/// Split a Read Tag response payload into (type, value bytes)
fn split_typed_value(data: &[u8]) -> Result<(CipType, Vec<u8>)> {
    if data.len() < 2 {
        return Err(AcqError::protocol("CIP: missing type code".to_string()));
    }
    let cip_type = CipType(u16::from_le_bytes([data[0], data[1]]));
    Ok((cip_type, data[2..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbolic_path_padding() {
        // Odd-length name gets a pad byte
        let path = symbolic_path("abc");
        assert_eq!(path, vec![0x91, 3, b'a', b'b', b'c', 0x00]);
        // Even-length name does not
        let path = symbolic_path("pump");
        assert_eq!(path, vec![0x91, 4, b'p', b'u', b'm', b'p']);
    }

    #[test]
    fn test_build_request_path_words() {
        let request = build_request(SVC_READ_TAG, &symbolic_path("abc"), &[0x01, 0x00]);
        assert_eq!(request[0], 0x4C);
        assert_eq!(request[1], 3); // 6 path bytes = 3 words
        assert_eq!(&request[8..], &[0x01, 0x00]);
    }

    #[test]
    fn test_parse_response_with_additional_status() {
        let body = [0xCC, 0x00, 0x04, 0x01, 0x34, 0x12, 0xAA];
        let response = parse_response(&body).unwrap();
        assert_eq!(response.service, 0x4C);
        assert_eq!(response.status, 0x04);
        assert_eq!(response.data, vec![0xAA]);
    }

    #[test]
    fn test_multiple_service_round_trip_layout() {
        let a = build_request(SVC_READ_TAG, &symbolic_path("ab"), &[0x01, 0x00]);
        let b = build_request(SVC_READ_TAG, &symbolic_path("cdef"), &[0x01, 0x00]);
        let packed = build_multiple_service(&[a.clone(), b.clone()]);

        assert_eq!(u16::from_le_bytes([packed[0], packed[1]]), 2);
        let offset_a = u16::from_le_bytes([packed[2], packed[3]]) as usize;
        let offset_b = u16::from_le_bytes([packed[4], packed[5]]) as usize;
        assert_eq!(offset_a, 6);
        assert_eq!(offset_b, 6 + a.len());
        assert_eq!(&packed[offset_a..offset_a + a.len()], &a[..]);
        assert_eq!(&packed[offset_b..], &b[..]);
    }

    #[test]
    fn test_split_multiple_service() {
        // Two embedded responses: DINT 7 and a failure
        let ok = [0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x07, 0x00, 0x00, 0x00];
        let fail = [0xCC, 0x00, 0x05, 0x00];
        let mut data = Vec::new();
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&(6u16).to_le_bytes());
        data.extend_from_slice(&((6 + ok.len()) as u16).to_le_bytes());
        data.extend_from_slice(&ok);
        data.extend_from_slice(&fail);

        let responses = split_multiple_service(&data).unwrap();
        assert_eq!(responses.len(), 2);
        assert!(responses[0].is_ok());
        let (cip_type, bytes) = split_typed_value(&responses[0].data).unwrap();
        assert_eq!(cip_type, CipType::DINT);
        assert_eq!(decode_cip_value(cip_type, &bytes), Some(Value::Int(7)));
        assert_eq!(responses[1].status, 0x05);
    }

    #[test]
    fn test_cip_value_codec() {
        assert_eq!(
            decode_cip_value(CipType::REAL, &25.0f32.to_le_bytes()),
            Some(Value::Float(25.0))
        );
        assert_eq!(
            decode_cip_value(CipType::INT, &(-7i16).to_le_bytes()),
            Some(Value::Int(-7))
        );
        assert_eq!(decode_cip_value(CipType::BOOL, &[0xFF]), Some(Value::Bool(true)));
        assert_eq!(decode_cip_value(CipType::BOOL, &[0x00]), Some(Value::Bool(false)));
        assert_eq!(decode_cip_value(CipType(0x02A0), &[0x00]), None);

        assert_eq!(
            encode_cip_value(CipType::DINT, &Value::Int(300)),
            Some(300i32.to_le_bytes().to_vec())
        );
        assert_eq!(encode_cip_value(CipType::REAL, &Value::Text("x".into())), None);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(CipType::DINT.name(), "DINT");
        assert_eq!(CipType::LREAL.name(), "LREAL");
        assert_eq!(CipType(0x02A0).name(), "UNKNOWN");
    }
}
