//! Notification wrapper tests: event shaping, listing suppression and sink
//! failure isolation, driven through a scriptable inner backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sandpiper_sftp::protocol::{FileAttrs, OpenFlags};
use sandpiper_sftp::vfs::notify::{Notification, NotificationHandler, NotifyFs};
use sandpiper_sftp::vfs::{
    CmdMethod, DirEntry, FileReader, FileWriter, ListMethod, VirtualFs,
};
use sandpiper_sftp::{Error, Result};

/// Inner backend that succeeds or fails on demand.
struct ScriptedFs {
    fail: bool,
}

struct NoopReader;

#[async_trait]
impl FileReader for NoopReader {
    async fn read_at(&self, _offset: u64, _len: u32) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

struct NoopWriter;

#[async_trait]
impl FileWriter for NoopWriter {
    async fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VirtualFs for ScriptedFs {
    fn fs_type(&self) -> &'static str {
        "os"
    }

    async fn file_read(&self, _path: &str) -> Result<Box<dyn FileReader>> {
        if self.fail {
            Err(Error::PermissionDenied)
        } else {
            Ok(Box::new(NoopReader))
        }
    }

    async fn file_write(&self, _path: &str, _flags: OpenFlags) -> Result<Box<dyn FileWriter>> {
        if self.fail {
            Err(Error::Unsupported)
        } else {
            Ok(Box::new(NoopWriter))
        }
    }

    async fn file_cmd(
        &self,
        _method: CmdMethod,
        _path: &str,
        _target: Option<&str>,
        _attrs: &FileAttrs,
    ) -> Result<()> {
        if self.fail {
            Err(Error::NoSuchFile)
        } else {
            Ok(())
        }
    }

    async fn file_list(&self, _method: ListMethod, _path: &str) -> Result<Vec<DirEntry>> {
        Ok(Vec::new())
    }
}

type Sink = Arc<Mutex<Vec<Notification>>>;

fn wrapped(fail: bool) -> (NotifyFs, Sink) {
    let sink: Sink = Arc::new(Mutex::new(Vec::new()));
    let collector = sink.clone();
    let callback: Arc<NotificationHandler> = Arc::new(move |n| {
        collector.lock().unwrap().push(n);
        Ok(())
    });

    let mut context = HashMap::new();
    context.insert("user".to_string(), "alice".to_string());
    context.insert("remote_addr".to_string(), "10.0.0.7:40122".to_string());
    context.insert("client_version".to_string(), "SSH-2.0-OpenSSH_9.6".to_string());

    let fs = NotifyFs::new(Arc::new(ScriptedFs { fail }), context, Some(callback));
    (fs, sink)
}

#[tokio::test]
async fn get_emits_event_with_session_context() {
    let (fs, sink) = wrapped(false);
    fs.file_read("/report.pdf").await.unwrap();

    let events = sink.lock().unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.event, "Get");
    assert_eq!(event.subject, "/report.pdf");
    assert_eq!(event.target, "");
    assert_eq!(event.user, "alice");
    assert_eq!(event.remote_addr, "10.0.0.7:40122");
    assert_eq!(event.client_version, "SSH-2.0-OpenSSH_9.6");
    assert_eq!(event.fs_type, "os");
    assert!(event.error.is_none());
}

#[tokio::test]
async fn failures_are_recorded_and_still_propagate() {
    let (fs, sink) = wrapped(true);
    let result = fs.file_read("/secret.txt").await;
    assert!(matches!(result.err(), Some(Error::PermissionDenied)));

    let events = sink.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].error.as_deref(), Some("permission denied"));
}

#[tokio::test]
async fn list_is_suppressed_but_stat_reports() {
    let (fs, sink) = wrapped(false);

    fs.file_list(ListMethod::List, "/").await.unwrap();
    assert!(sink.lock().unwrap().is_empty());

    fs.file_list(ListMethod::Stat, "/a.txt").await.unwrap();
    let events = sink.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "Stat");
}

#[tokio::test]
async fn two_path_commands_carry_the_target() {
    let (fs, sink) = wrapped(false);
    fs.file_cmd(
        CmdMethod::Rename,
        "/old.txt",
        Some("/new.txt"),
        &FileAttrs::default(),
    )
    .await
    .unwrap();

    let events = sink.lock().unwrap();
    assert_eq!(events[0].event, "Rename");
    assert_eq!(events[0].subject, "/old.txt");
    assert_eq!(events[0].target, "/new.txt");
}

#[tokio::test]
async fn sink_failure_never_reaches_the_client() {
    let callback: Arc<NotificationHandler> = Arc::new(|_| Err("sink is down".into()));
    let fs = NotifyFs::new(
        Arc::new(ScriptedFs { fail: false }),
        HashMap::new(),
        Some(callback),
    );

    // The operation outcome is unchanged by the broken sink.
    fs.file_write("/up.bin", OpenFlags(OpenFlags::WRITE)).await.unwrap();
    fs.file_cmd(CmdMethod::Mkdir, "/d", None, &FileAttrs::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn put_event_uses_write_vocabulary() {
    let (fs, sink) = wrapped(false);
    fs.file_write("/upload.bin", OpenFlags(OpenFlags::WRITE)).await.unwrap();

    let events = sink.lock().unwrap();
    assert_eq!(events[0].event, "Put");
    assert_eq!(events[0].subject, "/upload.bin");
}

#[tokio::test]
async fn notifications_serialize_to_json() {
    let (fs, sink) = wrapped(false);
    fs.file_cmd(CmdMethod::Remove, "/g.txt", None, &FileAttrs::default())
        .await
        .unwrap();

    let events = sink.lock().unwrap();
    let json = serde_json::to_value(&events[0]).unwrap();
    assert_eq!(json["event"], "Remove");
    assert_eq!(json["subject"], "/g.txt");
    assert_eq!(json["user"], "alice");
    assert!(json["time"].is_string());
}
