use super::{DataSource, OpenMode, SourceForm};
use crate::Status;

/// A source with no bytes. Writes are discarded and every read comes back empty.
#[derive(Debug, Default)]
pub struct NullDataSource {
    open: bool,
}

impl DataSource for NullDataSource {
    fn open(&mut self, _url: &str, _mode: OpenMode) -> Result<(), Status> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn form(&self) -> SourceForm {
        SourceForm::Local
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Status> {
        Ok(0)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Status> {
        Ok(buf.len())
    }

    fn move_to(&mut self, _position: u64) -> Result<(), Status> {
        Ok(())
    }

    fn size(&self) -> Result<u64, Status> {
        Ok(0)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
