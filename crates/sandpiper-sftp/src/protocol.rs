//! SFTP version 3 wire layer.
//!
//! Implements the packet framing, message types, status codes and attribute
//! encoding of draft-ietf-secsh-filexfer-02, which is the dialect spoken by
//! every mainstream client. Packets are length-prefixed: `u32 length`
//! followed by `length` bytes, the first of which is the packet type.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Protocol version answered to SSH_FXP_INIT.
pub const SFTP_VERSION: u32 = 3;

/// SFTP packet types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => PacketType::Init,
            2 => PacketType::Version,
            3 => PacketType::Open,
            4 => PacketType::Close,
            5 => PacketType::Read,
            6 => PacketType::Write,
            7 => PacketType::Lstat,
            8 => PacketType::Fstat,
            9 => PacketType::Setstat,
            10 => PacketType::Fsetstat,
            11 => PacketType::Opendir,
            12 => PacketType::Readdir,
            13 => PacketType::Remove,
            14 => PacketType::Mkdir,
            15 => PacketType::Rmdir,
            16 => PacketType::Realpath,
            17 => PacketType::Stat,
            18 => PacketType::Rename,
            19 => PacketType::Readlink,
            20 => PacketType::Symlink,
            101 => PacketType::Status,
            102 => PacketType::Handle,
            103 => PacketType::Data,
            104 => PacketType::Name,
            105 => PacketType::Attrs,
            200 => PacketType::Extended,
            201 => PacketType::ExtendedReply,
            other => {
                return Err(Error::Protocol(format!("unknown packet type: {}", other)));
            }
        })
    }
}

/// Status codes for SSH_FXP_STATUS replies.
///
/// Codes 0 through 8 come from filexfer-02. `QuotaExceeded` is the extension
/// code defined by the filexfer-13 draft; it is what mainstream clients
/// display as "quota exceeded" when a write is refused for lack of space.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
    QuotaExceeded = 15,
}

/// Open flags carried by SSH_FXP_OPEN.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x0000_0001;
    pub const WRITE: u32 = 0x0000_0002;
    pub const APPEND: u32 = 0x0000_0004;
    pub const CREAT: u32 = 0x0000_0008;
    pub const TRUNC: u32 = 0x0000_0010;
    pub const EXCL: u32 = 0x0000_0020;

    pub fn has_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    /// Any flag that implies mutation: write, append, create or truncate.
    pub fn wants_write(self) -> bool {
        self.0 & (Self::WRITE | Self::APPEND | Self::CREAT | Self::TRUNC) != 0
    }
}

/// File attributes as encoded in the `attrs` structure of filexfer-02.
///
/// Every field is optional; the flags word in the encoding says which are
/// present. `permissions` carries the full `st_mode` word including the
/// file-type bits.
#[derive(Debug, Clone, Default)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x0000_0001;
    const FLAG_UIDGID: u32 = 0x0000_0002;
    const FLAG_PERMISSIONS: u32 = 0x0000_0004;
    const FLAG_ACMODTIME: u32 = 0x0000_0008;

    /// Append the encoded attribute block to `buf`.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
    }

    /// Decode an attribute block, advancing `buf` past it.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let flags = codec::get_u32(buf)?;
        let mut attrs = FileAttrs::default();

        if flags & Self::FLAG_SIZE != 0 {
            attrs.size = Some(codec::get_u64(buf)?);
        }
        if flags & Self::FLAG_UIDGID != 0 {
            attrs.uid = Some(codec::get_u32(buf)?);
            attrs.gid = Some(codec::get_u32(buf)?);
        }
        if flags & Self::FLAG_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::get_u32(buf)?);
        }
        if flags & Self::FLAG_ACMODTIME != 0 {
            attrs.atime = Some(codec::get_u32(buf)?);
            attrs.mtime = Some(codec::get_u32(buf)?);
        }

        Ok(attrs)
    }

    /// Permission bits without the file-type bits, or `None` if absent.
    pub fn mode_bits(&self) -> Option<u32> {
        self.permissions.map(|p| p & 0o7777)
    }

    /// Whether the mode word marks a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self.permissions, Some(p) if p & 0o170000 == 0o040000)
    }
}

/// Largest packet accepted from a client. Generous enough for a 256 KiB
/// WRITE plus headers.
pub const MAX_PACKET_SIZE: usize = 512 * 1024;

/// Extract the next complete length-framed packet from `buf`, or `None` if
/// more bytes are needed. The returned payload excludes the length prefix.
///
/// SSH channel data does not respect packet boundaries, so callers keep a
/// running buffer and feed every data frame through here.
pub fn next_packet(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 {
        return Err(Error::Protocol("zero-length packet".into()));
    }
    if len > MAX_PACKET_SIZE {
        return Err(Error::Protocol(format!("packet of {} bytes exceeds limit", len)));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Encoding and decoding helpers for the primitive SFTP field types.
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    use crate::{Error, Result};

    pub fn get_u32(buf: &mut &[u8]) -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(Error::Protocol("short read for u32".into()));
        }
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut &[u8]) -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(Error::Protocol("short read for u64".into()));
        }
        Ok(buf.get_u64())
    }

    /// Decode a length-prefixed byte string.
    pub fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
        let len = get_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(Error::Protocol("short read for string".into()));
        }
        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }

    /// Decode a length-prefixed UTF-8 string.
    pub fn get_string(buf: &mut &[u8]) -> Result<String> {
        String::from_utf8(get_bytes(buf)?)
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 string: {}", e)))
    }

    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    pub fn put_string(buf: &mut BytesMut, s: &str) {
        put_bytes(buf, s.as_bytes());
    }
}
