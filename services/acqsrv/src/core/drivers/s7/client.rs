//! S7comm client over ISO-on-TCP (RFC 1006)
//!
//! Implements the minimal protocol surface the driver needs: COTP
//! connection setup, S7 communication setup, and single-item read/write
//! var requests. All multi-byte fields are big-endian.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::address::S7Area;
use crate::error::{AcqError, Result};

const TPKT_HEADER_LEN: usize = 4;
const COTP_DT_HEADER: [u8; 3] = [0x02, 0xF0, 0x80];
/// PDU length requested during setup communication
const REQUESTED_PDU_LEN: u16 = 960;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected S7 session
///
/// One request is in flight at a time; the driver serializes access.
pub struct S7Client {
    stream: TcpStream,
    pdu_ref: u16,
    /// PDU size negotiated during setup
    pdu_len: u16,
}

impl S7Client {
    /// Open the ISO-on-TCP transport and negotiate an S7 session
    pub async fn connect(host: &str, port: u16, rack: u16, slot: u16) -> Result<Self> {
        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| AcqError::timeout(format!("S7 connect to {}:{}", host, port)))?
        .map_err(|e| AcqError::transport(format!("S7 connect {}:{}: {}", host, port, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| AcqError::transport(e.to_string()))?;

        let mut client = Self {
            stream,
            pdu_ref: 0,
            pdu_len: REQUESTED_PDU_LEN,
        };
        client.cotp_connect(rack, slot).await?;
        client.setup_communication().await?;
        debug!("S7 session up ({}:{}, pdu {})", host, port, client.pdu_len);
        Ok(client)
    }

    /// Negotiated PDU length
    pub fn pdu_len(&self) -> u16 {
        self.pdu_len
    }

    /// Read `len` bytes from an area starting at a byte offset
    pub async fn read_bytes(&mut self, area: S7Area, start: u32, len: u16) -> Result<Vec<u8>> {
        let mut params = Vec::with_capacity(14);
        params.push(0x04); // read var
        params.push(0x01); // one item
        push_item_spec(&mut params, area, start, len);

        let response = self.exchange(&params, &[]).await?;
        let (resp_params, data) = split_response(&response)?;
        if resp_params.first() != Some(&0x04) {
            return Err(AcqError::protocol("S7 read: unexpected function".to_string()));
        }

        // Item payload: return code, transport size, length (bits), data
        if data.len() < 4 {
            return Err(AcqError::protocol("S7 read: short item".to_string()));
        }
        let return_code = data[0];
        if return_code != 0xFF {
            return Err(AcqError::protocol(format!(
                "S7 read failed: return code 0x{:02X}",
                return_code
            )));
        }
        let transport = data[1];
        let length_field = u16::from_be_bytes([data[2], data[3]]) as usize;
        // Transport 0x03/0x04 report the length in bits
        let byte_len = match transport {
            0x03 | 0x04 => length_field / 8,
            _ => length_field,
        };
        let payload = data
            .get(4..4 + byte_len)
            .ok_or_else(|| AcqError::protocol("S7 read: truncated payload".to_string()))?;
        Ok(payload.to_vec())
    }

    /// Write bytes to an area starting at a byte offset
    pub async fn write_bytes(&mut self, area: S7Area, start: u32, bytes: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(14);
        params.push(0x05); // write var
        params.push(0x01); // one item
        push_item_spec(&mut params, area, start, bytes.len() as u16);

        let mut data = Vec::with_capacity(4 + bytes.len());
        data.push(0x00); // reserved
        data.push(0x04); // transport size: byte (length in bits)
        data.extend_from_slice(&(((bytes.len() as u16) * 8).to_be_bytes()));
        data.extend_from_slice(bytes);

        let response = self.exchange(&params, &data).await?;
        let (resp_params, item) = split_response(&response)?;
        if resp_params.first() != Some(&0x05) {
            return Err(AcqError::protocol("S7 write: unexpected function".to_string()));
        }
        match item.first() {
            Some(0xFF) => Ok(()),
            Some(code) => Err(AcqError::protocol(format!(
                "S7 write failed: return code 0x{:02X}",
                code
            ))),
            None => Err(AcqError::protocol("S7 write: empty item".to_string())),
        }
    }

    // ========================================================================
    // Session establishment
    // ========================================================================

    async fn cotp_connect(&mut self, rack: u16, slot: u16) -> Result<()> {
        // Remote TSAP: 0x03 (S7 basic) + rack/slot encoding
        let remote_tsap: [u8; 2] = [0x03, ((rack << 5) | (slot & 0x1F)) as u8];
        let local_tsap: [u8; 2] = [0x01, 0x00];

        let mut cotp = Vec::with_capacity(18);
        cotp.push(17); // length indicator
        cotp.push(0xE0); // CR
        cotp.extend_from_slice(&[0x00, 0x00]); // dst ref
        cotp.extend_from_slice(&[0x00, 0x01]); // src ref
        cotp.push(0x00); // class 0
        cotp.extend_from_slice(&[0xC0, 0x01, 0x0A]); // TPDU size 1024
        cotp.extend_from_slice(&[0xC1, 0x02, local_tsap[0], local_tsap[1]]);
        cotp.extend_from_slice(&[0xC2, 0x02, remote_tsap[0], remote_tsap[1]]);

        self.send_tpkt(&cotp).await?;
        let frame = self.read_tpkt().await?;
        // Expect a connection confirm (0xD0)
        if frame.get(1) != Some(&0xD0) {
            return Err(AcqError::transport("COTP connect refused".to_string()));
        }
        Ok(())
    }

    async fn setup_communication(&mut self) -> Result<()> {
        let params: [u8; 8] = {
            let mut p = [0u8; 8];
            p[0] = 0xF0; // setup communication
            // p[1] reserved
            p[2..4].copy_from_slice(&1u16.to_be_bytes()); // max AMQ calling
            p[4..6].copy_from_slice(&1u16.to_be_bytes()); // max AMQ called
            p[6..8].copy_from_slice(&REQUESTED_PDU_LEN.to_be_bytes());
            p
        };
        let response = self.exchange(&params, &[]).await?;
        // Ack parameters mirror the request; negotiated PDU length is last
        if response.len() >= 8 && response[0] == 0xF0 {
            self.pdu_len = u16::from_be_bytes([response[6], response[7]]);
        }
        Ok(())
    }

    // ========================================================================
    // Framing
    // ========================================================================

    /// Send an S7 job and return the ack-data body (params + data)
    async fn exchange(&mut self, params: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);

        let mut pdu = Vec::with_capacity(COTP_DT_HEADER.len() + 10 + params.len() + data.len());
        pdu.extend_from_slice(&COTP_DT_HEADER);
        pdu.push(0x32); // S7 protocol id
        pdu.push(0x01); // job
        pdu.extend_from_slice(&[0x00, 0x00]); // reserved
        pdu.extend_from_slice(&self.pdu_ref.to_be_bytes());
        pdu.extend_from_slice(&(params.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
        pdu.extend_from_slice(params);
        pdu.extend_from_slice(data);

        self.send_tpkt(&pdu).await?;
        let frame = self.read_tpkt().await?;

        // Strip COTP DT header
        let body = frame
            .get(COTP_DT_HEADER.len()..)
            .ok_or_else(|| AcqError::protocol("S7: short COTP frame".to_string()))?;
        if body.first() != Some(&0x32) {
            return Err(AcqError::protocol("S7: bad protocol id".to_string()));
        }
        let rosctr = body.get(1).copied().unwrap_or(0);
        // Ack-data carries a 2-byte error field after the standard header
        let header_len = if rosctr == 0x03 { 12 } else { 10 };
        if body.len() < header_len {
            return Err(AcqError::protocol("S7: short header".to_string()));
        }
        if rosctr == 0x03 {
            let err_class = body[10];
            let err_code = body[11];
            if err_class != 0 || err_code != 0 {
                return Err(AcqError::protocol(format!(
                    "S7 error class 0x{:02X} code 0x{:02X}",
                    err_class, err_code
                )));
            }
        }
        Ok(body[header_len..].to_vec())
    }

    async fn send_tpkt(&mut self, payload: &[u8]) -> Result<()> {
        let total = (TPKT_HEADER_LEN + payload.len()) as u16;
        let mut frame = Vec::with_capacity(total as usize);
        frame.extend_from_slice(&[0x03, 0x00]);
        frame.extend_from_slice(&total.to_be_bytes());
        frame.extend_from_slice(payload);
        tokio::time::timeout(IO_TIMEOUT, self.stream.write_all(&frame))
            .await
            .map_err(|_| AcqError::timeout("S7 write".to_string()))?
            .map_err(|e| AcqError::transport(format!("S7 send: {}", e)))?;
        Ok(())
    }

    async fn read_tpkt(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; TPKT_HEADER_LEN];
        tokio::time::timeout(IO_TIMEOUT, self.stream.read_exact(&mut header))
            .await
            .map_err(|_| AcqError::timeout("S7 read".to_string()))?
            .map_err(|e| AcqError::transport(format!("S7 recv: {}", e)))?;
        if header[0] != 0x03 {
            return Err(AcqError::protocol("TPKT: bad version".to_string()));
        }
        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        if total < TPKT_HEADER_LEN {
            return Err(AcqError::protocol("TPKT: bad length".to_string()));
        }
        let mut payload = vec![0u8; total - TPKT_HEADER_LEN];
        tokio::time::timeout(IO_TIMEOUT, self.stream.read_exact(&mut payload))
            .await
            .map_err(|_| AcqError::timeout("S7 read".to_string()))?
            .map_err(|e| AcqError::transport(format!("S7 recv: {}", e)))?;
        Ok(payload)
    }
}

/// Push a read/write var item specification
fn push_item_spec(buffer: &mut Vec<u8>, area: S7Area, start_byte: u32, byte_count: u16) {
    buffer.push(0x12); // variable specification
    buffer.push(0x0A); // length of following spec
    buffer.push(0x10); // syntax id: S7-any
    buffer.push(0x02); // transport size: byte
    buffer.extend_from_slice(&byte_count.to_be_bytes());
    buffer.extend_from_slice(&area.db_number().to_be_bytes());
    buffer.push(area.code());
    // Address is a bit offset packed into 3 bytes
    let bit_addr = start_byte * 8;
    buffer.push(((bit_addr >> 16) & 0xFF) as u8);
    buffer.push(((bit_addr >> 8) & 0xFF) as u8);
    buffer.push((bit_addr & 0xFF) as u8);
}

/// Split an ack-data body into (function params, item data)
fn split_response(body: &[u8]) -> Result<(&[u8], &[u8])> {
    // Read/write responses carry 2 parameter bytes: function + item count
    if body.len() < 2 {
        return Err(AcqError::protocol("S7: empty response".to_string()));
    }
    Ok((&body[..2], &body[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::drivers::s7::address::S7Area;

    #[test]
    fn test_item_spec_encoding() {
        let mut buffer = Vec::new();
        push_item_spec(&mut buffer, S7Area::DataBlock(10), 2, 1);
        assert_eq!(
            buffer,
            vec![
                0x12, 0x0A, 0x10, 0x02, // spec header + byte transport
                0x00, 0x01, // count
                0x00, 0x0A, // DB 10
                0x84, // DB area
                0x00, 0x00, 0x10, // bit address 2*8 = 16
            ]
        );
    }

    #[test]
    fn test_item_spec_marker_area() {
        let mut buffer = Vec::new();
        push_item_spec(&mut buffer, S7Area::Marker, 100, 2);
        assert_eq!(buffer[6..8], [0x00, 0x00]); // no DB number
        assert_eq!(buffer[8], 0x83);
        // 100 * 8 = 800 = 0x320
        assert_eq!(&buffer[9..12], &[0x00, 0x03, 0x20]);
    }

    #[test]
    fn test_split_response() {
        let body = [0x04, 0x01, 0xFF, 0x04, 0x00, 0x10, 0xAB, 0xCD];
        let (params, data) = split_response(&body).unwrap();
        assert_eq!(params, &[0x04, 0x01]);
        assert_eq!(data[0], 0xFF);
        assert!(split_response(&[0x04]).is_err());
    }
}
