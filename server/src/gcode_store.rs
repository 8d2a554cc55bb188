//! Gcode file access for the job manager. Print files live behind this
//! trait so the bridge never assumes how they are stored; the shipped
//! implementation is a flat directory on disk.

use std::{io, path::PathBuf};

use async_trait::async_trait;
use common::status::SdFileEntry;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such gcode file {0:?}")]
    NotFound(String),
    #[error("gcode filename {0:?} is not allowed")]
    BadName(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Byte offsets bracketing the printable body of a file, when the
/// store knows them. Slicers bury configuration after the final move;
/// progress over the whole file would stall short of 100%.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcodeMetadata {
    pub gcode_start_byte: Option<u64>,
    pub gcode_end_byte: Option<u64>,
}

/// Forward-only line reader over one print file. `position` is the byte
/// offset just past the last returned line, terminator included.
#[async_trait]
pub trait GcodeReader: Send {
    async fn next_line(&mut self) -> io::Result<Option<String>>;
    fn position(&self) -> u64;
}

pub struct GcodeFile {
    pub size: u64,
    pub metadata: GcodeMetadata,
    pub reader: Box<dyn GcodeReader>,
}

#[async_trait]
pub trait GcodeStore: Send + Sync {
    async fn open(&self, name: &str) -> Result<GcodeFile, StoreError>;
    async fn list(&self) -> Result<Vec<SdFileEntry>, StoreError>;
}

const GCODE_EXTENSIONS: [&str; 3] = ["gcode", "gco", "g"];

/// Flat-directory store. Names are bare filenames; anything that looks
/// like path traversal is refused outright.
pub struct FsGcodeStore {
    root: PathBuf,
}

impl FsGcodeStore {
    pub fn new(root: PathBuf) -> Self {
        FsGcodeStore { root }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(StoreError::BadName(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl GcodeStore for FsGcodeStore {
    async fn open(&self, name: &str) -> Result<GcodeFile, StoreError> {
        let path = self.resolve(name)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(error) => return Err(error.into()),
        };
        let size = file.metadata().await?.len();
        Ok(GcodeFile {
            size,
            // A flat directory has nowhere to keep slicer metadata, so
            // progress falls back to raw byte offset over size.
            metadata: GcodeMetadata::default(),
            reader: Box::new(FsGcodeReader {
                reader: BufReader::new(file),
                position: 0,
            }),
        })
    }

    async fn list(&self) -> Result<Vec<SdFileEntry>, StoreError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let is_gcode = name
                .rsplit_once('.')
                .map_or(false, |(_, ext)| {
                    GCODE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
                });
            if !is_gcode {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(SdFileEntry {
                name,
                size: metadata.len(),
                display_name: None,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

struct FsGcodeReader {
    reader: BufReader<File>,
    position: u64,
}

#[async_trait]
impl GcodeReader for FsGcodeReader {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        self.position += read as u64;
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_traversal_is_refused() {
        let store = FsGcodeStore::new(PathBuf::from("/tmp/gcode"));
        assert!(matches!(
            store.resolve("../etc/passwd"),
            Err(StoreError::BadName(_))
        ));
        assert!(matches!(
            store.resolve("sub/dir.gcode"),
            Err(StoreError::BadName(_))
        ));
        assert!(store.resolve("benchy.gcode").is_ok());
    }

    #[tokio::test]
    async fn test_fs_reader_tracks_byte_position() {
        let dir = std::env::temp_dir().join(format!("gcode-store-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("cube.gcode");
        tokio::fs::write(&path, "G28\nG1 X10\n").await.unwrap();

        let store = FsGcodeStore::new(dir.clone());
        let mut file = store.open("cube.gcode").await.unwrap();
        assert_eq!(file.size, 11);
        assert_eq!(file.reader.next_line().await.unwrap().as_deref(), Some("G28"));
        assert_eq!(file.reader.position(), 4);
        assert_eq!(
            file.reader.next_line().await.unwrap().as_deref(),
            Some("G1 X10")
        );
        assert_eq!(file.reader.position(), 11);
        assert_eq!(file.reader.next_line().await.unwrap(), None);

        assert!(matches!(
            store.open("missing.gcode").await,
            Err(StoreError::NotFound(_))
        ));
        let listing = store.list().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "cube.gcode");
        assert_eq!(listing[0].size, 11);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
