use super::{split_url, DataSource, OpenMode, SourceForm};
use crate::Status;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// A local file. Accepts `file://<path>` URLs and bare paths.
#[derive(Debug, Default)]
pub struct FileDataSource {
    file: Option<File>,
    path: Option<PathBuf>,
}

impl FileDataSource {
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    fn file(&mut self) -> Result<&mut File, Status> {
        self.file.as_mut().ok_or(Status::NotOpen)
    }
}

impl DataSource for FileDataSource {
    fn open(&mut self, url: &str, mode: OpenMode) -> Result<(), Status> {
        let (_, path) = split_url(url)?;
        let mut options = OpenOptions::new();
        options.read(true);
        match mode {
            OpenMode::Read => (),
            OpenMode::ReadWrite => {
                options.write(true);
            }
            OpenMode::Create => {
                options.write(true).create(true).truncate(true);
            }
        }
        self.file = Some(options.open(path)?);
        self.path = Some(PathBuf::from(path));
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn form(&self) -> SourceForm {
        SourceForm::Local
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        Ok(self.file()?.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Status> {
        Ok(self.file()?.write(buf)?)
    }

    fn move_to(&mut self, position: u64) -> Result<(), Status> {
        self.file()?.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn size(&self) -> Result<u64, Status> {
        let file = self.file.as_ref().ok_or(Status::NotOpen)?;
        Ok(file.metadata()?.len())
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
