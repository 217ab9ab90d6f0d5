use crate::ipc::{IpcError, Message, Result};
use crate::transport;
use std::io::{Read, Write};

// message_type i32 | request_id i64 | body_size u32, native byte order.
pub const HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: i32,
    pub request_id: i64,
    pub body_size: u32,
}

impl FrameHeader {
    pub fn for_message(message: &Message) -> Result<Self> {
        let body_size = u32::try_from(message.content.len()).map_err(|_| {
            IpcError::Protocol(format!(
                "body of {} bytes does not fit the 32-bit size field",
                message.content.len()
            ))
        })?;
        Ok(Self {
            message_type: message.message_type,
            request_id: message.request_id,
            body_size,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.message_type.to_ne_bytes());
        out[4..12].copy_from_slice(&self.request_id.to_ne_bytes());
        out[12..16].copy_from_slice(&self.body_size.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut message_type = [0u8; 4];
        let mut request_id = [0u8; 8];
        let mut body_size = [0u8; 4];
        message_type.copy_from_slice(&bytes[0..4]);
        request_id.copy_from_slice(&bytes[4..12]);
        body_size.copy_from_slice(&bytes[12..16]);
        Self {
            message_type: i32::from_ne_bytes(message_type),
            request_id: i64::from_ne_bytes(request_id),
            body_size: u32::from_ne_bytes(body_size),
        }
    }
}

pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let header = FrameHeader::for_message(message)?;
    let mut out = Vec::with_capacity(HEADER_SIZE + message.content.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&message.content);
    Ok(out)
}

/// The buffer must hold exactly the header plus `body_size` bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<Message> {
    let Some((head, body)) = bytes.split_first_chunk::<HEADER_SIZE>() else {
        return Err(IpcError::Protocol(format!(
            "frame of {} bytes is shorter than the {HEADER_SIZE}-byte header",
            bytes.len()
        )));
    };
    let header = FrameHeader::from_bytes(head);
    if body.len() != header.body_size as usize {
        return Err(IpcError::Protocol(format!(
            "header declares {} body bytes, frame carries {}",
            header.body_size,
            body.len()
        )));
    }
    Ok(Message {
        request_id: header.request_id,
        message_type: header.message_type,
        content: body.to_vec(),
    })
}

pub fn read_header<R>(reader: &mut R) -> Result<FrameHeader>
where
    R: Read + ?Sized,
{
    let mut head = [0u8; HEADER_SIZE];
    transport::read_exact(reader, &mut head)?;
    Ok(FrameHeader::from_bytes(&head))
}

pub fn read_body<R>(reader: &mut R, header: &FrameHeader) -> Result<Vec<u8>>
where
    R: Read + ?Sized,
{
    let mut body = vec![0u8; header.body_size as usize];
    transport::read_exact(reader, &mut body)?;
    Ok(body)
}

pub fn read_frame<R>(reader: &mut R) -> Result<Message>
where
    R: Read + ?Sized,
{
    let header = read_header(reader)?;
    let content = read_body(reader, &header)?;
    Ok(Message {
        request_id: header.request_id,
        message_type: header.message_type,
        content,
    })
}

pub fn write_frame<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: Write + ?Sized,
{
    let header = FrameHeader::for_message(message)?;
    transport::write_all(writer, &header.to_bytes())?;
    if !message.content.is_empty() {
        transport::write_all(writer, &message.content)?;
    }
    Ok(())
}
