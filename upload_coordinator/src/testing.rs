use std::path::Path;

use bytes::Bytes;
use futures::{stream, StreamExt};

use crate::{ChunkStream, UploadsConfig};

pub fn payload(data: &'static [u8]) -> ChunkStream {
    stream::once(async move { Ok(Bytes::from_static(data)) }).boxed()
}

pub async fn read_all(mut stream: ChunkStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(bytes) = stream.next().await {
        out.extend_from_slice(&bytes.unwrap());
    }
    out
}

pub fn test_config(root: &Path) -> UploadsConfig {
    UploadsConfig {
        temp_chunks_dir: root.join("temp_chunks").to_string_lossy().into_owned(),
        uploads_dir: root.join("uploads").to_string_lossy().into_owned(),
        ..UploadsConfig::default()
    }
}

/// Regular files below `dir`, ignoring a missing directory.
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(files_in(&path));
        } else {
            files.push(path.to_string_lossy().into_owned());
        }
    }
    files.sort();
    files
}
