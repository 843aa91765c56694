//! Directory id backups written through the public API.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{create_test_cryptor, init_tracing};
use oxcrypt_vfs::config::DIR_ID_FILE;
use oxcrypt_vfs::crypto::{CHUNK_OVERHEAD, HEADER_SIZE};
use oxcrypt_vfs::fs::{DirIdBackupError, DirectoryIdBackup, backup_manually, read_dir_id_backup};
use oxcrypt_vfs::{CiphertextDirectory, CiphertextNameConfig, DirId};
use tempfile::TempDir;

fn backup() -> DirectoryIdBackup {
    DirectoryIdBackup::new(create_test_cryptor(), Arc::new(CiphertextNameConfig::default()))
}

#[test]
fn test_execute_twice_fails_with_already_exists() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let dir = CiphertextDirectory::new(
        tmp.path(),
        DirId::from_raw("8b3a8fcf-4c2d-4c5f-a0e7-77d04e6c5bf1"),
    );
    let backup = backup();

    backup.execute(&dir).unwrap();
    let err = backup.execute(&dir).unwrap_err();
    match err {
        DirIdBackupError::AlreadyExists { path } => assert_eq!(path, tmp.path().join(DIR_ID_FILE)),
        other => panic!("expected AlreadyExists, got {other:?}"),
    }

    let decrypted = create_test_cryptor()
        .decrypt_file(&std::fs::read(tmp.path().join(DIR_ID_FILE)).unwrap())
        .unwrap();
    assert_eq!(decrypted, dir.dir_id.as_str().as_bytes());
}

#[test]
fn test_backup_file_layout() {
    let tmp = TempDir::new().unwrap();
    let dir = CiphertextDirectory::new(tmp.path(), DirId::from_raw("abc"));
    backup().execute(&dir).unwrap();

    let len = std::fs::metadata(tmp.path().join(DIR_ID_FILE)).unwrap().len();
    assert_eq!(len, (HEADER_SIZE + CHUNK_OVERHEAD + 3) as u64);
    assert_eq!(
        read_dir_id_backup(&create_test_cryptor(), &CiphertextNameConfig::default(), tmp.path())
            .unwrap(),
        dir.dir_id
    );
}

#[test]
fn test_manual_backup_honours_configured_file_name() {
    let tmp = TempDir::new().unwrap();
    let cryptor = create_test_cryptor();
    let names = CiphertextNameConfig {
        dir_id_file: "dir.id".to_string(),
        ..CiphertextNameConfig::default()
    };
    let dir = CiphertextDirectory::new(tmp.path(), DirId::from_raw("manual"));

    backup_manually(&cryptor, &names, &dir).unwrap();
    assert!(tmp.path().join("dir.id").exists());
    assert!(!tmp.path().join(DIR_ID_FILE).exists());
    assert_eq!(read_dir_id_backup(&cryptor, &names, tmp.path()).unwrap(), dir.dir_id);
    assert!(matches!(
        backup_manually(&cryptor, &names, &dir),
        Err(DirIdBackupError::AlreadyExists { .. })
    ));
}

#[test]
fn test_concurrent_backups_only_one_wins() {
    let tmp = TempDir::new().unwrap();
    let backup = Arc::new(backup());
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let backup = Arc::clone(&backup);
            let barrier = Arc::clone(&barrier);
            let dir = CiphertextDirectory::new(tmp.path(), DirId::from_raw(format!("id-{i}")));
            thread::spawn(move || {
                barrier.wait();
                backup.execute(&dir).map(|()| dir.dir_id)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, DirIdBackupError::AlreadyExists { .. })));
    assert_eq!(backup.read(tmp.path()).unwrap(), *winners[0]);
}
