//! Scoped scratch files for source input and compiled output.
//!
//! A [`TemporaryFile`] wraps [`tempfile::NamedTempFile`]: it guarantees the
//! backing file is removed when dropped, tolerates the compiler having
//! already removed it (GCC and friends sometimes unlink their own `-o`
//! target on failure), and exposes the plain read/write/path operations the
//! execution engine and daemon service need.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemporaryFileError {
	#[error("failed to create temporary file in {dir}: {source}")]
	Create { dir: PathBuf, #[source] source: io::Error },
	#[error("failed to read temporary file {path}: {source}")]
	Read { path: PathBuf, #[source] source: io::Error },
	#[error("failed to write temporary file {path}: {source}")]
	Write { path: PathBuf, #[source] source: io::Error },
}

/// A named scratch file scoped to the lifetime of one compile task.
pub struct TemporaryFile {
	inner: tempfile::NamedTempFile,
}

impl TemporaryFile {
	/// Creates a new empty temporary file under `dir`, named with the
	/// `compute-servant-` prefix so operators can spot them in `/proc` or
	/// `lsof` output.
	pub fn new_in(dir: impl AsRef<Path>) -> Result<Self, TemporaryFileError> {
		let dir = dir.as_ref();
		let inner = tempfile::Builder::new()
			.prefix("compute-servant-")
			.tempfile_in(dir)
			.map_err(|source| TemporaryFileError::Create { dir: dir.to_path_buf(), source })?;
		Ok(Self { inner })
	}

	pub fn path(&self) -> &Path {
		self.inner.path()
	}

	/// Rewinds and reads the whole file. The caller is expected to have
	/// finished writing (e.g. the compiler child process has exited) before
	/// calling this; a concurrent writer would race the rewind.
	pub fn read_all(&mut self) -> Result<Vec<u8>, TemporaryFileError> {
		let path = self.path().to_path_buf();
		let file = self.inner.as_file_mut();
		file.seek(SeekFrom::Start(0)).map_err(|source| TemporaryFileError::Read { path: path.clone(), source })?;
		let mut buf = Vec::new();
		file.read_to_end(&mut buf).map_err(|source| TemporaryFileError::Read { path, source })?;
		Ok(buf)
	}

	pub fn write_all(&mut self, data: &[u8]) -> Result<(), TemporaryFileError> {
		let path = self.path().to_path_buf();
		let file: &mut File = self.inner.as_file_mut();
		file.write_all(data).map_err(|source| TemporaryFileError::Write { path: path.clone(), source })?;
		file.flush().map_err(|source| TemporaryFileError::Write { path, source })
	}

	/// Opens an independent file handle for the same underlying file,
	/// positioned at the start. Used to hand a child process its own fd for
	/// stdin/stdout/stderr redirection without disturbing this handle's own
	/// read/write position.
	pub fn reopen(&self) -> Result<File, TemporaryFileError> {
		self.inner.reopen().map_err(|source| TemporaryFileError::Read { path: self.path().to_path_buf(), source })
	}

	/// Consumes the handle, returning the path without removing the file.
	/// Used when handing the path to a spawned child as its `-o` target.
	pub fn into_path_not_removed(self) -> PathBuf {
		// `keep()` disarms the drop-time unlink; the caller now owns cleanup.
		match self.inner.keep() {
			Ok((_file, path)) => path,
			Err(e) => e.file.path().to_path_buf(),
		}
	}
}
