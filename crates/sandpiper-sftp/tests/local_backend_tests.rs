//! Local backend integration tests: permission gates, path containment,
//! write flows and metadata commands against a real temporary directory.

use std::path::PathBuf;
use std::sync::Arc;

use sandpiper_sftp::path::PathResolver;
use sandpiper_sftp::permission::PermissionSet;
use sandpiper_sftp::protocol::{FileAttrs, OpenFlags};
use sandpiper_sftp::vfs::local::LocalFs;
use sandpiper_sftp::vfs::{CmdMethod, FileReader, FileWriter, ListMethod, VirtualFs};
use sandpiper_sftp::{Error, Result};
use tempfile::TempDir;

fn backend(perms: &[&str], read_only: bool) -> (LocalFs, TempDir) {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("data")).unwrap();
    let fs = LocalFs::new(dir.path(), PermissionSet::from_names(perms), read_only);
    (fs, dir)
}

const ALL: &[&str] = &["read", "read-content", "create", "update", "delete"];

async fn put(fs: &LocalFs, path: &str, data: &[u8]) {
    let writer = fs.file_write(path, OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT))
        .await
        .unwrap();
    writer.write_at(0, data).await.unwrap();
    writer.commit().await.unwrap();
}

#[tokio::test]
async fn read_requires_read_content_permission() {
    let (fs, _dir) = backend(&["create"], false);
    match fs.file_read("/hello.txt").await {
        Err(Error::PermissionDenied) => {}
        other => panic!("expected PermissionDenied, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn stat_outside_root_is_no_such_file() {
    let (fs, _dir) = backend(ALL, false);
    match fs.file_list(ListMethod::Stat, "../../etc/passwd").await {
        Err(Error::NoSuchFile) => {}
        other => panic!("expected NoSuchFile, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn write_creates_parent_directories_and_round_trips() {
    let (fs, dir) = backend(ALL, false);

    put(&fs, "/a/b.txt", b"hello world").await;

    // The directory chain under the data root came into being with the file.
    assert!(dir.path().join("data/a").is_dir());
    assert!(dir.path().join("data/a/b.txt").is_file());

    let reader = fs.file_read("/a/b.txt").await.unwrap();
    assert_eq!(reader.read_at(0, 64).await.unwrap(), b"hello world");

    // Offset at the end answers EOF as an empty read.
    assert!(reader.read_at(11, 16).await.unwrap().is_empty());
    assert_eq!(reader.read_at(6, 64).await.unwrap(), b"world");
}

#[tokio::test]
async fn overwrite_requires_update_permission() {
    let (fs, _dir) = backend(ALL, false);
    put(&fs, "/f.txt", b"v1").await;

    let (fs_create_only, dir2) = backend(&["create"], false);
    std::fs::write(dir2.path().join("data/f.txt"), b"v1").unwrap();
    match fs_create_only.file_write("/f.txt", OpenFlags(OpenFlags::WRITE)).await {
        Err(Error::PermissionDenied) => {}
        other => panic!("expected PermissionDenied, got {:?}", other.err()),
    }

    // With update permission the same write truncates and succeeds.
    put(&fs, "/f.txt", b"v2").await;
    let reader = fs.file_read("/f.txt").await.unwrap();
    assert_eq!(reader.read_at(0, 8).await.unwrap(), b"v2");
}

#[tokio::test]
async fn writing_to_a_directory_is_unsupported() {
    let (fs, dir) = backend(ALL, false);
    std::fs::create_dir_all(dir.path().join("data/docs")).unwrap();

    match fs.file_write("/docs", OpenFlags(OpenFlags::WRITE)).await {
        Err(Error::Unsupported) => {}
        other => panic!("expected Unsupported, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn missing_file_without_create_is_denied() {
    let (fs, _dir) = backend(&["update"], false);
    match fs.file_write("/new.txt", OpenFlags(OpenFlags::WRITE)).await {
        Err(Error::PermissionDenied) => {}
        other => panic!("expected PermissionDenied, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn read_only_rejects_every_mutation_but_not_listing() {
    let (fs, dir) = backend(ALL, true);
    std::fs::write(dir.path().join("data/present.txt"), b"x").unwrap();

    match fs.file_write("/x.txt", OpenFlags(OpenFlags::WRITE)).await {
        Err(Error::Unsupported) => {}
        other => panic!("expected Unsupported, got {:?}", other.err()),
    }
    match fs
        .file_cmd(CmdMethod::Mkdir, "/x", None, &FileAttrs::default())
        .await
    {
        Err(Error::Unsupported) => {}
        other => panic!("expected Unsupported, got {:?}", other),
    }
    match fs
        .file_cmd(CmdMethod::Remove, "/present.txt", None, &FileAttrs::default())
        .await
    {
        Err(Error::Unsupported) => {}
        other => panic!("expected Unsupported, got {:?}", other),
    }

    // A listing on the same backend still works.
    let entries = fs.file_list(ListMethod::List, "/").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "present.txt");
}

#[tokio::test]
async fn quota_predicate_rejects_writes_with_extension_code() {
    let (fs, _dir) = backend(ALL, false);
    let fs = fs.with_disk_space_check(Arc::new(|| false));

    match fs.file_write("/big.bin", OpenFlags(OpenFlags::WRITE)).await {
        Err(e @ Error::QuotaExceeded) => assert_eq!(e.status_code(), 15),
        other => panic!("expected QuotaExceeded, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn mkdir_is_idempotent() {
    let (fs, dir) = backend(ALL, false);

    fs.file_cmd(CmdMethod::Mkdir, "/nested/dir", None, &FileAttrs::default())
        .await
        .unwrap();
    fs.file_cmd(CmdMethod::Mkdir, "/nested/dir", None, &FileAttrs::default())
        .await
        .unwrap();

    assert!(dir.path().join("data/nested/dir").is_dir());
}

#[tokio::test]
async fn remove_of_absent_file_still_surfaces_failure() {
    let (fs, _dir) = backend(ALL, false);
    let err = fs
        .file_cmd(CmdMethod::Remove, "/ghost.txt", None, &FileAttrs::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(err.status_code(), 4);
}

#[tokio::test]
async fn remove_and_rmdir_delete() {
    let (fs, dir) = backend(ALL, false);
    put(&fs, "/gone.txt", b"x").await;
    put(&fs, "/tree/deep/leaf.txt", b"x").await;

    fs.file_cmd(CmdMethod::Remove, "/gone.txt", None, &FileAttrs::default())
        .await
        .unwrap();
    assert!(!dir.path().join("data/gone.txt").exists());

    fs.file_cmd(CmdMethod::Rmdir, "/tree", None, &FileAttrs::default())
        .await
        .unwrap();
    assert!(!dir.path().join("data/tree").exists());
}

#[tokio::test]
async fn rename_moves_within_root_and_rejects_escaping_targets() {
    let (fs, dir) = backend(ALL, false);
    put(&fs, "/old.txt", b"content").await;

    fs.file_cmd(
        CmdMethod::Rename,
        "/old.txt",
        Some("/sub/new.txt"),
        &FileAttrs::default(),
    )
    .await
    .unwrap_err();
    // Parent of the target does not exist; file stays put.
    assert!(dir.path().join("data/old.txt").exists());

    fs.file_cmd(CmdMethod::Rename, "/old.txt", Some("/new.txt"), &FileAttrs::default())
        .await
        .unwrap();
    assert!(dir.path().join("data/new.txt").exists());

    match fs
        .file_cmd(
            CmdMethod::Rename,
            "/new.txt",
            Some("../../outside.txt"),
            &FileAttrs::default(),
        )
        .await
    {
        Err(Error::Unsupported) => {}
        other => panic!("expected Unsupported for escaping target, got {:?}", other),
    }
}

#[tokio::test]
async fn setstat_applies_clamped_modes() {
    use std::os::unix::fs::PermissionsExt;

    let (fs, dir) = backend(ALL, false);
    put(&fs, "/m.txt", b"x").await;

    let attrs = FileAttrs {
        permissions: Some(0o100600),
        ..Default::default()
    };
    fs.file_cmd(CmdMethod::Setstat, "/m.txt", None, &attrs)
        .await
        .unwrap();
    let mode = std::fs::metadata(dir.path().join("data/m.txt"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);

    // No permission bits in the request falls back to 0644.
    fs.file_cmd(CmdMethod::Setstat, "/m.txt", None, &FileAttrs::default())
        .await
        .unwrap();
    let mode = std::fs::metadata(dir.path().join("data/m.txt"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o644);
}

#[tokio::test]
async fn symlink_is_created_at_the_link_path() {
    let (fs, dir) = backend(ALL, false);
    put(&fs, "/src.txt", b"payload").await;

    fs.file_cmd(
        CmdMethod::Symlink,
        "/src.txt",
        Some("/link.txt"),
        &FileAttrs::default(),
    )
    .await
    .unwrap();

    let link = dir.path().join("data/link.txt");
    assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
    assert_eq!(std::fs::read(&link).unwrap(), b"payload");
}

#[tokio::test]
async fn stat_reports_metadata_and_missing_files() {
    let (fs, _dir) = backend(ALL, false);
    put(&fs, "/s.txt", b"12345").await;

    let entries = fs.file_list(ListMethod::Stat, "/s.txt").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "s.txt");
    assert_eq!(entries[0].size, 5);
    assert!(!entries[0].is_dir);

    match fs.file_list(ListMethod::Stat, "/absent.txt").await {
        Err(Error::NoSuchFile) => {}
        other => panic!("expected NoSuchFile, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn list_requires_read_permission() {
    let (fs, _dir) = backend(&["read-content"], false);
    match fs.file_list(ListMethod::List, "/").await {
        Err(Error::PermissionDenied) => {}
        other => panic!("expected PermissionDenied, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn path_resolver_is_injectable() {
    struct PinnedResolver(PathBuf);

    impl PathResolver for PinnedResolver {
        fn resolve(&self, _request_path: &str) -> Result<PathBuf> {
            Ok(self.0.clone())
        }
    }

    let dir = TempDir::new().unwrap();
    let pinned = dir.path().join("pinned.txt");
    std::fs::write(&pinned, b"always me").unwrap();

    let fs = LocalFs::new(dir.path(), PermissionSet::all(), false)
        .with_resolver(Arc::new(PinnedResolver(pinned)));

    // Whatever the client asks for, the stub resolver answers the same file.
    let reader = fs.file_read("/anything/else.txt").await.unwrap();
    assert_eq!(reader.read_at(0, 32).await.unwrap(), b"always me");
}

#[tokio::test]
async fn concurrent_writes_to_distinct_files_succeed() {
    let (fs, dir) = backend(ALL, false);
    let fs = Arc::new(fs);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let fs = fs.clone();
        tasks.push(tokio::spawn(async move {
            let path = format!("/par/file-{}.txt", i);
            let writer = fs
                .file_write(&path, OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT))
                .await
                .unwrap();
            writer.write_at(0, format!("body-{}", i).as_bytes()).await.unwrap();
            writer.commit().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let entries = fs.file_list(ListMethod::List, "/par").await.unwrap();
    assert_eq!(entries.len(), 8);
    assert!(dir.path().join("data/par/file-7.txt").exists());
}
