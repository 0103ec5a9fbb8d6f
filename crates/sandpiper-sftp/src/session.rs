//! Session binding and the per-channel SFTP request server.
//!
//! When an authenticated channel asks for the `sftp` subsystem, the binder
//! projects the connection's extension map into a typed [`SessionContext`],
//! materializes the user's backend and wires it to an [`SftpSession`]. The
//! session owns the packet pump: it reassembles length-framed SFTP packets
//! from SSH data frames, translates each request into one of the four
//! backend operations and encodes the reply.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use crate::auth::extensions;
use crate::path::virtual_clean;
use crate::permission::PermissionSet;
use crate::protocol::{
    self, codec, FileAttrs, OpenFlags, PacketType, StatusCode, SFTP_VERSION,
};
use crate::users::{BackendConfig, FilesystemConfig};
use crate::vfs::local::LocalFs;
use crate::vfs::notify::{NotificationHandler, NotifyFs};
use crate::vfs::s3::S3Fs;
use crate::vfs::{CmdMethod, DirEntry, FileReader, FileWriter, ListMethod, VirtualFs};
use crate::{Error, Result};

/// Extension keys that stay server-internal; everything else becomes the
/// backend's notification context.
const INTERNAL_EXTENSIONS: [&str; 5] = [
    extensions::FILESYSTEM,
    extensions::DEFAULT_FS,
    "server_version",
    extensions::LOGIN_AT,
    extensions::UUID,
];

/// Directory entries returned per READDIR round trip.
const READDIR_CHUNK: usize = 100;

/// Upper bound on one READ request. Clients asking for more get a short
/// read, which the protocol allows.
const MAX_READ_LEN: u32 = 256 * 1024;

/// Open handles per session before OPEN starts failing.
const MAX_HANDLES: usize = 1024;

/// Typed projection of the SSH extensions for one session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub uuid: String,
    pub user: String,
    pub remote_addr: String,
    pub client_version: String,
    pub login_at: String,
    /// JSON-serialized filesystem config chosen at login.
    pub filesystem: String,
    pub use_default_fs: bool,
}

impl SessionContext {
    pub fn from_extensions(ext: &HashMap<String, String>) -> Self {
        let get = |key: &str| ext.get(key).cloned().unwrap_or_default();
        Self {
            uuid: get(extensions::UUID),
            user: get(extensions::USER),
            remote_addr: get(extensions::REMOTE_ADDR),
            client_version: get(extensions::CLIENT_VERSION),
            login_at: get(extensions::LOGIN_AT),
            filesystem: get(extensions::FILESYSTEM),
            use_default_fs: ext.get(extensions::DEFAULT_FS).map(String::as_str) == Some("true"),
        }
    }
}

/// The extension entries a backend may see: everything except the
/// server-internal keys.
pub fn backend_context(ext: &HashMap<String, String>) -> HashMap<String, String> {
    ext.iter()
        .filter(|(key, _)| !INTERNAL_EXTENSIONS.contains(&key.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Materializes per-session backends from connection extensions.
pub struct SessionBinder {
    pub base_path: PathBuf,
    pub read_only: bool,
    pub notify: bool,
    pub callback: Option<Arc<NotificationHandler>>,
}

impl SessionBinder {
    /// Bind a session for an authenticated channel. Returns `None` when the
    /// `uuid` extension is empty, which means authentication was bypassed or
    /// corrupted; such channels are abandoned.
    pub fn bind(&self, ext: &HashMap<String, String>) -> Option<SftpSession> {
        let context = SessionContext::from_extensions(ext);
        if context.uuid.is_empty() {
            warn!("channel carries no session uuid, abandoning");
            return None;
        }

        let mut backend = self.user_filesystem(&context);
        if self.notify {
            backend = Arc::new(NotifyFs::new(
                backend,
                backend_context(ext),
                self.callback.clone(),
            ));
        }

        Some(SftpSession::new(backend, context.uuid))
    }

    /// Choose and build the backend for a session context. Falls back to the
    /// local backend at the server base path with default permissions when
    /// the user has no usable config, the config fails to parse, or the tag
    /// is unknown.
    pub fn user_filesystem(&self, context: &SessionContext) -> Arc<dyn VirtualFs> {
        if context.use_default_fs {
            return self.default_filesystem();
        }

        let config: FilesystemConfig = match serde_json::from_str(&context.filesystem) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "unparsable filesystem config, using server default");
                return self.default_filesystem();
            }
        };

        let permissions = config.permission_set();
        match config.backend() {
            Some(BackendConfig::S3(params)) => {
                Arc::new(S3Fs::new(&params, permissions, self.read_only))
            }
            Some(BackendConfig::Os(params)) => {
                let base = if params.base_path.is_empty() {
                    self.base_path.clone()
                } else {
                    PathBuf::from(params.base_path)
                };
                Arc::new(LocalFs::new(base, permissions, self.read_only))
            }
            None => {
                warn!(fs = %config.fs, "unknown filesystem tag, using server default");
                self.default_filesystem()
            }
        }
    }

    fn default_filesystem(&self) -> Arc<dyn VirtualFs> {
        Arc::new(LocalFs::new(
            &self.base_path,
            PermissionSet::all(),
            self.read_only,
        ))
    }
}

/// An open handle vended to the client. The handle owns its backend
/// resources; dropping it releases them.
enum SessionHandle {
    Reader {
        reader: Box<dyn FileReader>,
        path: String,
    },
    Writer {
        writer: Box<dyn FileWriter>,
        path: String,
    },
    Dir {
        entries: Vec<DirEntry>,
        index: usize,
        path: String,
    },
}

impl SessionHandle {
    fn path(&self) -> &str {
        match self {
            SessionHandle::Reader { path, .. }
            | SessionHandle::Writer { path, .. }
            | SessionHandle::Dir { path, .. } => path,
        }
    }
}

/// The per-channel SFTP request server.
pub struct SftpSession {
    backend: Arc<dyn VirtualFs>,
    session_id: String,
    handles: HashMap<Vec<u8>, SessionHandle>,
    next_handle_id: u32,
    initialized: bool,
    inbox: BytesMut,
}

impl SftpSession {
    pub fn new(backend: Arc<dyn VirtualFs>, session_id: String) -> Self {
        Self {
            backend,
            session_id,
            handles: HashMap::new(),
            next_handle_id: 0,
            initialized: false,
            inbox: BytesMut::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn backend(&self) -> &Arc<dyn VirtualFs> {
        &self.backend
    }

    /// Feed one SSH data frame through the packet pump. Frames do not align
    /// with SFTP packets, so input accumulates until at least one complete
    /// packet is available. The returned bytes, possibly covering several
    /// replies, go back onto the channel verbatim.
    pub async fn handle_data(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.inbox.extend_from_slice(data);

        let mut out = BytesMut::new();
        while let Some(packet) = protocol::next_packet(&mut self.inbox)? {
            let reply = self.handle_packet(&packet).await?;
            out.put_u32(reply.len() as u32);
            out.extend_from_slice(&reply);
        }
        Ok(out.to_vec())
    }

    async fn handle_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let (&type_byte, mut buf) = packet
            .split_first()
            .ok_or_else(|| Error::Protocol("empty packet".into()))?;

        let packet_type = match PacketType::try_from(type_byte) {
            Ok(t) => t,
            Err(_) => {
                // Unknown packet types still get an in-band answer when the
                // request id is readable.
                let request_id = codec::get_u32(&mut buf)?;
                warn!(session = %self.session_id, type_byte, "unknown packet type");
                return Ok(status_reply(request_id, StatusCode::OpUnsupported, "Operation unsupported"));
            }
        };

        if !self.initialized && packet_type != PacketType::Init {
            return Err(Error::Protocol(format!(
                "{:?} before initialization",
                packet_type
            )));
        }

        debug!(session = %self.session_id, packet = ?packet_type, "sftp packet");

        match packet_type {
            PacketType::Init => self.handle_init(&mut buf),
            PacketType::Open => self.handle_open(&mut buf).await,
            PacketType::Close => self.handle_close(&mut buf).await,
            PacketType::Read => self.handle_read(&mut buf).await,
            PacketType::Write => self.handle_write(&mut buf).await,
            PacketType::Stat | PacketType::Lstat => self.handle_stat(&mut buf).await,
            PacketType::Fstat => self.handle_fstat(&mut buf).await,
            PacketType::Setstat => self.handle_setstat(&mut buf).await,
            PacketType::Fsetstat => self.handle_fsetstat(&mut buf).await,
            PacketType::Opendir => self.handle_opendir(&mut buf).await,
            PacketType::Readdir => self.handle_readdir(&mut buf),
            PacketType::Remove => self.handle_cmd_single(&mut buf, CmdMethod::Remove).await,
            PacketType::Mkdir => self.handle_mkdir(&mut buf).await,
            PacketType::Rmdir => self.handle_cmd_single(&mut buf, CmdMethod::Rmdir).await,
            PacketType::Realpath => self.handle_realpath(&mut buf),
            PacketType::Rename => self.handle_rename(&mut buf).await,
            PacketType::Symlink => self.handle_symlink(&mut buf).await,
            other => {
                let request_id = codec::get_u32(&mut buf)?;
                debug!(session = %self.session_id, packet = ?other, "unsupported request");
                Ok(status_reply(
                    request_id,
                    StatusCode::OpUnsupported,
                    "Operation unsupported",
                ))
            }
        }
    }

    fn handle_init(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let client_version = codec::get_u32(buf)?;
        debug!(session = %self.session_id, client_version, "sftp init");
        self.initialized = true;

        let mut reply = BytesMut::new();
        reply.put_u8(PacketType::Version as u8);
        reply.put_u32(SFTP_VERSION);
        Ok(reply.to_vec())
    }

    async fn handle_open(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let flags = OpenFlags(codec::get_u32(buf)?);
        let _attrs = FileAttrs::decode(buf)?;

        if self.handles.len() >= MAX_HANDLES {
            warn!(session = %self.session_id, "handle limit reached");
            return Ok(status_reply(request_id, StatusCode::Failure, "Failure"));
        }

        let handle = if flags.wants_write() {
            match self.backend.file_write(&path, flags).await {
                Ok(writer) => SessionHandle::Writer { writer, path },
                Err(e) => return Ok(error_reply(request_id, &e)),
            }
        } else {
            match self.backend.file_read(&path).await {
                Ok(reader) => SessionHandle::Reader { reader, path },
                Err(e) => return Ok(error_reply(request_id, &e)),
            }
        };

        let id = self.allocate_handle(handle);
        Ok(handle_reply(request_id, &id))
    }

    async fn handle_close(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle = codec::get_bytes(buf)?;

        match self.handles.remove(&handle) {
            // Buffered backends upload here; the commit outcome is the
            // close outcome.
            Some(SessionHandle::Writer { writer, .. }) => match writer.commit().await {
                Ok(()) => Ok(status_reply(request_id, StatusCode::Ok, "Success")),
                Err(e) => Ok(error_reply(request_id, &e)),
            },
            Some(_) => Ok(status_reply(request_id, StatusCode::Ok, "Success")),
            None => Ok(status_reply(request_id, StatusCode::BadMessage, "Bad message")),
        }
    }

    async fn handle_read(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle = codec::get_bytes(buf)?;
        let offset = codec::get_u64(buf)?;
        let len = codec::get_u32(buf)?.min(MAX_READ_LEN);

        let Some(SessionHandle::Reader { reader, .. }) = self.handles.get(&handle) else {
            return Ok(status_reply(request_id, StatusCode::BadMessage, "Bad message"));
        };

        match reader.read_at(offset, len).await {
            Ok(data) if data.is_empty() => {
                Ok(status_reply(request_id, StatusCode::Eof, "End of file"))
            }
            Ok(data) => Ok(data_reply(request_id, &data)),
            Err(e) => Ok(error_reply(request_id, &e)),
        }
    }

    async fn handle_write(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle = codec::get_bytes(buf)?;
        let offset = codec::get_u64(buf)?;
        let data = codec::get_bytes(buf)?;

        let Some(SessionHandle::Writer { writer, .. }) = self.handles.get(&handle) else {
            return Ok(status_reply(request_id, StatusCode::BadMessage, "Bad message"));
        };

        match writer.write_at(offset, &data).await {
            Ok(()) => Ok(status_reply(request_id, StatusCode::Ok, "Success")),
            Err(e) => Ok(error_reply(request_id, &e)),
        }
    }

    async fn handle_stat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        self.stat_path(request_id, &path).await
    }

    async fn handle_fstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle = codec::get_bytes(buf)?;

        let Some(path) = self.handles.get(&handle).map(|h| h.path().to_string()) else {
            return Ok(status_reply(request_id, StatusCode::BadMessage, "Bad message"));
        };
        self.stat_path(request_id, &path).await
    }

    async fn stat_path(&mut self, request_id: u32, path: &str) -> Result<Vec<u8>> {
        match self.backend.file_list(ListMethod::Stat, path).await {
            Ok(entries) => match entries.first() {
                Some(entry) => Ok(attrs_reply(request_id, &entry.attrs())),
                None => Ok(error_reply(request_id, &Error::NoSuchFile)),
            },
            Err(e) => Ok(error_reply(request_id, &e)),
        }
    }

    async fn handle_setstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let attrs = FileAttrs::decode(buf)?;
        self.run_cmd(request_id, CmdMethod::Setstat, &path, None, &attrs)
            .await
    }

    async fn handle_fsetstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle = codec::get_bytes(buf)?;
        let attrs = FileAttrs::decode(buf)?;

        let Some(path) = self.handles.get(&handle).map(|h| h.path().to_string()) else {
            return Ok(status_reply(request_id, StatusCode::BadMessage, "Bad message"));
        };
        self.run_cmd(request_id, CmdMethod::Setstat, &path, None, &attrs)
            .await
    }

    async fn handle_opendir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;

        if self.handles.len() >= MAX_HANDLES {
            warn!(session = %self.session_id, "handle limit reached");
            return Ok(status_reply(request_id, StatusCode::Failure, "Failure"));
        }

        match self.backend.file_list(ListMethod::List, &path).await {
            Ok(entries) => {
                let id = self.allocate_handle(SessionHandle::Dir {
                    entries,
                    index: 0,
                    path,
                });
                Ok(handle_reply(request_id, &id))
            }
            Err(e) => Ok(error_reply(request_id, &e)),
        }
    }

    fn handle_readdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle = codec::get_bytes(buf)?;

        let Some(SessionHandle::Dir { entries, index, .. }) = self.handles.get_mut(&handle)
        else {
            return Ok(status_reply(request_id, StatusCode::BadMessage, "Bad message"));
        };

        if *index >= entries.len() {
            return Ok(status_reply(request_id, StatusCode::Eof, "End of directory"));
        }

        let end = (*index + READDIR_CHUNK).min(entries.len());
        let chunk = &entries[*index..end];

        let mut reply = BytesMut::new();
        reply.put_u8(PacketType::Name as u8);
        reply.put_u32(request_id);
        reply.put_u32(chunk.len() as u32);
        for entry in chunk {
            entry.encode_to(&mut reply);
        }

        *index = end;
        Ok(reply.to_vec())
    }

    async fn handle_cmd_single(&mut self, buf: &mut &[u8], method: CmdMethod) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        self.run_cmd(request_id, method, &path, None, &FileAttrs::default())
            .await
    }

    async fn handle_mkdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let attrs = FileAttrs::decode(buf)?;
        self.run_cmd(request_id, CmdMethod::Mkdir, &path, None, &attrs)
            .await
    }

    fn handle_realpath(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let resolved = virtual_clean(&path);

        let mut reply = BytesMut::new();
        reply.put_u8(PacketType::Name as u8);
        reply.put_u32(request_id);
        reply.put_u32(1);
        codec::put_string(&mut reply, &resolved);
        codec::put_string(&mut reply, &resolved);
        FileAttrs::default().encode_to(&mut reply);
        Ok(reply.to_vec())
    }

    async fn handle_rename(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let old_path = codec::get_string(buf)?;
        let new_path = codec::get_string(buf)?;
        self.run_cmd(
            request_id,
            CmdMethod::Rename,
            &old_path,
            Some(&new_path),
            &FileAttrs::default(),
        )
        .await
    }

    async fn handle_symlink(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let link_path = codec::get_string(buf)?;
        let target_path = codec::get_string(buf)?;
        // The link is created at `link_path` pointing to `target_path`, so
        // the target is the operation's subject and the link the target
        // argument, mirroring the two-path command shape.
        self.run_cmd(
            request_id,
            CmdMethod::Symlink,
            &target_path,
            Some(&link_path),
            &FileAttrs::default(),
        )
        .await
    }

    async fn run_cmd(
        &mut self,
        request_id: u32,
        method: CmdMethod,
        path: &str,
        target: Option<&str>,
        attrs: &FileAttrs,
    ) -> Result<Vec<u8>> {
        match self.backend.file_cmd(method, path, target, attrs).await {
            Ok(()) => Ok(status_reply(request_id, StatusCode::Ok, "Success")),
            Err(e) => Ok(error_reply(request_id, &e)),
        }
    }

    fn allocate_handle(&mut self, handle: SessionHandle) -> Vec<u8> {
        let id = self.next_handle_id.to_be_bytes().to_vec();
        self.next_handle_id += 1;
        self.handles.insert(id.clone(), handle);
        id
    }
}

fn status_reply(request_id: u32, code: StatusCode, message: &str) -> Vec<u8> {
    let mut reply = BytesMut::new();
    reply.put_u8(PacketType::Status as u8);
    reply.put_u32(request_id);
    reply.put_u32(code as u32);
    codec::put_string(&mut reply, message);
    codec::put_string(&mut reply, "en");
    reply.to_vec()
}

fn error_reply(request_id: u32, error: &Error) -> Vec<u8> {
    let mut reply = BytesMut::new();
    reply.put_u8(PacketType::Status as u8);
    reply.put_u32(request_id);
    reply.put_u32(error.status_code());
    codec::put_string(&mut reply, error.wire_message());
    codec::put_string(&mut reply, "en");
    reply.to_vec()
}

fn handle_reply(request_id: u32, handle: &[u8]) -> Vec<u8> {
    let mut reply = BytesMut::new();
    reply.put_u8(PacketType::Handle as u8);
    reply.put_u32(request_id);
    codec::put_bytes(&mut reply, handle);
    reply.to_vec()
}

fn data_reply(request_id: u32, data: &[u8]) -> Vec<u8> {
    let mut reply = BytesMut::new();
    reply.put_u8(PacketType::Data as u8);
    reply.put_u32(request_id);
    codec::put_bytes(&mut reply, data);
    reply.to_vec()
}

fn attrs_reply(request_id: u32, attrs: &FileAttrs) -> Vec<u8> {
    let mut reply = BytesMut::new();
    reply.put_u8(PacketType::Attrs as u8);
    reply.put_u32(request_id);
    attrs.encode_to(&mut reply);
    reply.to_vec()
}
