//! Per-connection transfer session.
//!
//! Pulls complete frames off the connection's input buffer, decodes one
//! request per frame, and appends the response frames to an output buffer
//! the caller flushes to the connection. At most one file operation is in
//! flight per session; upload and download are mutually exclusive.
//!
//! Error containment: framing and protocol violations fail the session (the
//! connection is force-closed by the caller); a filesystem failure resets
//! the file state and answers `Unknown`, and only a repeat on the same
//! session escalates to a session failure.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

use bytes::{Bytes, BytesMut};

use protocol_transfer::{
    Cmd, DecodeError, FrameError, Request, Response, TransferCode, chunk_size, split_frame,
};
use reactor::Buffer;

use crate::file_manager::FileManager;
use crate::metrics;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("empty file digest")]
    EmptyDigest,
    #[error("another transfer is in flight on this session")]
    TransferCollision,
    #[error("resumed upload without a matching partial file")]
    MissingUploadHandle,
    #[error("repeated filesystem failure: {0}")]
    RepeatedFilesystemFailure(io::Error),
}

enum Transfer {
    Upload,
    Download { offset: i64, size: i64 },
}

struct ActiveFile {
    file: File,
    md5: String,
    op: Transfer,
}

enum ReadOutcome {
    Chunk {
        chunk: Vec<u8>,
        send_offset: i64,
        total: i64,
        complete: bool,
    },
    Failed(io::Error),
}

pub struct FileSession {
    /// Last sequence number seen; echoed verbatim in responses.
    seq: i32,
    active: Option<ActiveFile>,
    uploading: bool,
    fs_errors: u32,
}

impl Default for FileSession {
    fn default() -> Self {
        FileSession::new()
    }
}

impl FileSession {
    pub fn new() -> FileSession {
        FileSession {
            seq: 0,
            active: None,
            uploading: false,
            fs_errors: 0,
        }
    }

    pub fn has_open_file(&self) -> bool {
        self.active.is_some()
    }

    /// Drain every complete frame from `buf`, appending response frames to
    /// `out`. `Ok` leaves any trailing partial frame in place for the next
    /// read; `Err` means the connection must be closed.
    pub fn process_buffer(
        &mut self,
        buf: &mut Buffer,
        files: &FileManager,
        out: &mut BytesMut,
    ) -> Result<(), SessionError> {
        loop {
            let (request, consumed) = {
                let Some((body, consumed)) = split_frame(buf.peek())? else {
                    return Ok(());
                };
                (Request::decode(body)?, consumed)
            };
            buf.retrieve(consumed);
            self.handle_request(request, files, out)?;
        }
    }

    fn handle_request(
        &mut self,
        request: Request,
        files: &FileManager,
        out: &mut BytesMut,
    ) -> Result<(), SessionError> {
        self.seq = request.seq;
        tracing::debug!(
            cmd = ?request.cmd,
            seq = request.seq,
            digest = %request.file_md5,
            offset = request.offset,
            file_size = request.file_size,
            chunk = request.data.len(),
            "request"
        );
        match request.cmd {
            Cmd::UploadReq => self.handle_upload(request, files, out),
            Cmd::DownloadReq => self.handle_download(request, files, out),
            // Request::decode only yields request commands.
            other => Err(DecodeError::NotARequest(other).into()),
        }
    }

    fn handle_upload(
        &mut self,
        request: Request,
        files: &FileManager,
        out: &mut BytesMut,
    ) -> Result<(), SessionError> {
        let Request {
            file_md5,
            offset,
            file_size,
            data,
            ..
        } = request;
        if file_md5.is_empty() {
            return Err(SessionError::EmptyDigest);
        }
        metrics::UPLOAD_REQUESTS.increment();

        // Idempotent completion for digests the store already has.
        if files.contains(&file_md5) && !self.uploading {
            self.respond(
                out,
                Cmd::UploadResp,
                TransferCode::Complete,
                &file_md5,
                file_size,
                file_size,
                Bytes::new(),
            );
            return Ok(());
        }

        if let Some(active) = &self.active {
            if active.md5 != file_md5 || !matches!(active.op, Transfer::Upload) {
                return Err(SessionError::TransferCollision);
            }
        }

        if offset == 0 {
            // Fresh upload into the staging file; replacing the slot
            // releases any prior handle.
            let file = match OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(files.staging_path_for(&file_md5))
            {
                Ok(file) => file,
                Err(e) => {
                    return self.filesystem_error(out, Cmd::UploadResp, &file_md5, "open", e);
                }
            };
            self.active = Some(ActiveFile {
                file,
                md5: file_md5.clone(),
                op: Transfer::Upload,
            });
            self.uploading = true;
        } else if self.active.is_none() {
            // Resume after a reconnect: reopen the staging file without
            // truncation when it already covers [0, offset).
            let path = files.staging_path_for(&file_md5);
            let resumable = std::fs::metadata(&path)
                .map(|m| m.is_file() && m.len() >= offset as u64)
                .unwrap_or(false);
            if !resumable {
                self.reset_file();
                return Err(SessionError::MissingUploadHandle);
            }
            let file = match OpenOptions::new().write(true).open(&path) {
                Ok(file) => file,
                Err(e) => {
                    return self.filesystem_error(out, Cmd::UploadResp, &file_md5, "reopen", e);
                }
            };
            self.active = Some(ActiveFile {
                file,
                md5: file_md5.clone(),
                op: Transfer::Upload,
            });
            self.uploading = true;
        }

        let io_result = {
            let Some(active) = self.active.as_mut() else {
                return Err(SessionError::MissingUploadHandle);
            };
            active
                .file
                .seek(SeekFrom::Start(offset as u64))
                .and_then(|_| active.file.write_all(&data))
                .and_then(|_| active.file.flush())
        };
        if let Err(e) = io_result {
            return self.filesystem_error(out, Cmd::UploadResp, &file_md5, "write", e);
        }

        let written_to = offset + data.len() as i64;
        if written_to == file_size {
            // Drop the handle, then move the staging file into place.
            self.reset_file();
            if let Err(e) = files.publish(&file_md5) {
                return self.filesystem_error(out, Cmd::UploadResp, &file_md5, "publish", e);
            }
            metrics::UPLOADS_COMPLETED.increment();
            self.respond(
                out,
                Cmd::UploadResp,
                TransferCode::Complete,
                &file_md5,
                file_size,
                file_size,
                Bytes::new(),
            );
        } else {
            self.respond(
                out,
                Cmd::UploadResp,
                TransferCode::Progress,
                &file_md5,
                written_to,
                file_size,
                Bytes::new(),
            );
        }
        Ok(())
    }

    fn handle_download(
        &mut self,
        request: Request,
        files: &FileManager,
        out: &mut BytesMut,
    ) -> Result<(), SessionError> {
        let Request {
            file_md5, net_type, ..
        } = request;
        if file_md5.is_empty() {
            return Err(SessionError::EmptyDigest);
        }
        metrics::DOWNLOAD_REQUESTS.increment();

        if let Some(active) = &self.active {
            if active.md5 != file_md5 || !matches!(active.op, Transfer::Download { .. }) {
                return Err(SessionError::TransferCollision);
            }
        }

        if !files.contains(&file_md5) {
            self.respond(
                out,
                Cmd::DownloadResp,
                TransferCode::NotExist,
                &file_md5,
                0,
                0,
                Bytes::new(),
            );
            return Ok(());
        }

        if self.active.is_none() {
            let path = files.path_for(&file_md5);
            let mut file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    return self.filesystem_error(out, Cmd::DownloadResp, &file_md5, "open", e);
                }
            };
            let size = match file.seek(SeekFrom::End(0)) {
                Ok(size) => size as i64,
                Err(e) => {
                    return self.filesystem_error(out, Cmd::DownloadResp, &file_md5, "size", e);
                }
            };
            if size <= 0 {
                // Empty files are not downloadable.
                let err = io::Error::new(io::ErrorKind::InvalidData, "file is empty");
                return self.filesystem_error(out, Cmd::DownloadResp, &file_md5, "size", err);
            }
            if let Err(e) = file.seek(SeekFrom::Start(0)) {
                return self.filesystem_error(out, Cmd::DownloadResp, &file_md5, "rewind", e);
            }
            self.active = Some(ActiveFile {
                file,
                md5: file_md5.clone(),
                op: Transfer::Download { offset: 0, size },
            });
        }

        let outcome = {
            let Some(active) = self.active.as_mut() else {
                return Err(SessionError::TransferCollision);
            };
            let ActiveFile { file, op, .. } = active;
            let Transfer::Download { offset, size } = op else {
                return Err(SessionError::TransferCollision);
            };
            let remaining = *size - *offset;
            let n = chunk_size(net_type.unwrap_or_default(), remaining);
            if n <= 0 {
                ReadOutcome::Failed(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "no bytes remaining",
                ))
            } else {
                let mut chunk = vec![0u8; n as usize];
                match file
                    .seek(SeekFrom::Start(*offset as u64))
                    .and_then(|_| file.read_exact(&mut chunk))
                {
                    Ok(()) => {
                        let send_offset = *offset;
                        *offset += n;
                        ReadOutcome::Chunk {
                            chunk,
                            send_offset,
                            total: *size,
                            complete: *offset == *size,
                        }
                    }
                    Err(e) => ReadOutcome::Failed(e),
                }
            }
        };

        match outcome {
            ReadOutcome::Failed(e) => {
                self.filesystem_error(out, Cmd::DownloadResp, &file_md5, "read", e)
            }
            ReadOutcome::Chunk {
                chunk,
                send_offset,
                total,
                complete,
            } => {
                let code = if complete {
                    TransferCode::Complete
                } else {
                    TransferCode::Progress
                };
                self.respond(
                    out,
                    Cmd::DownloadResp,
                    code,
                    &file_md5,
                    send_offset,
                    total,
                    Bytes::from(chunk),
                );
                if complete {
                    self.reset_file();
                    metrics::DOWNLOADS_COMPLETED.increment();
                }
                Ok(())
            }
        }
    }

    fn respond(
        &self,
        out: &mut BytesMut,
        cmd: Cmd,
        code: TransferCode,
        file_md5: &str,
        offset: i64,
        file_size: i64,
        data: Bytes,
    ) {
        tracing::debug!(
            ?cmd,
            ?code,
            seq = self.seq,
            digest = %file_md5,
            offset,
            file_size,
            chunk = data.len(),
            "response"
        );
        Response {
            cmd,
            seq: self.seq,
            code,
            file_md5: file_md5.to_string(),
            offset,
            file_size,
            data,
        }
        .encode_frame(out);
    }

    /// Reset on filesystem failure: drop the file state, answer `Unknown`
    /// once, escalate on repetition.
    fn filesystem_error(
        &mut self,
        out: &mut BytesMut,
        cmd: Cmd,
        file_md5: &str,
        what: &str,
        err: io::Error,
    ) -> Result<(), SessionError> {
        tracing::error!(digest = %file_md5, "{what} failed: {err}");
        self.reset_file();
        self.fs_errors += 1;
        if self.fs_errors > 1 {
            return Err(SessionError::RepeatedFilesystemFailure(err));
        }
        self.respond(out, cmd, TransferCode::Unknown, file_md5, 0, 0, Bytes::new());
        Ok(())
    }

    fn reset_file(&mut self) {
        self.active = None;
        self.uploading = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_transfer::{CELLULAR_CHUNK, NetType};

    const MD5: &str = "0123456789abcdef0123456789abcdef";
    const OTHER_MD5: &str = "fedcba9876543210fedcba9876543210";

    fn store() -> (tempfile::TempDir, FileManager) {
        let dir = tempfile::tempdir().unwrap();
        let files = FileManager::open(dir.path()).unwrap();
        (dir, files)
    }

    fn run(
        session: &mut FileSession,
        files: &FileManager,
        request: Request,
    ) -> Result<Vec<Response>, SessionError> {
        let mut wire = BytesMut::new();
        request.encode_frame(&mut wire);
        let mut buf = Buffer::new();
        buf.append(&wire);

        let mut out = BytesMut::new();
        session.process_buffer(&mut buf, files, &mut out)?;

        let mut responses = Vec::new();
        let mut rest: &[u8] = &out;
        while let Some((body, consumed)) = split_frame(rest).unwrap() {
            responses.push(Response::decode(body).unwrap());
            rest = &rest[consumed..];
        }
        Ok(responses)
    }

    fn run_one(
        session: &mut FileSession,
        files: &FileManager,
        request: Request,
    ) -> Result<Response, SessionError> {
        let mut responses = run(session, files, request)?;
        assert_eq!(responses.len(), 1);
        Ok(responses.remove(0))
    }

    #[test]
    fn upload_in_two_chunks() {
        let (_dir, files) = store();
        let mut session = FileSession::new();
        let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i % 255) as u8).collect();

        let first = run_one(
            &mut session,
            &files,
            Request::upload(1, MD5, 0, payload.len() as i64, payload[..524_288].to_vec()),
        )
        .unwrap();
        assert_eq!(first.code, TransferCode::Progress);
        assert_eq!(first.offset, 524_288);
        assert_eq!(first.seq, 1);

        let second = run_one(
            &mut session,
            &files,
            Request::upload(2, MD5, 524_288, payload.len() as i64, payload[524_288..].to_vec()),
        )
        .unwrap();
        assert_eq!(second.code, TransferCode::Complete);
        assert_eq!(second.offset, 1_048_576);
        assert_eq!(second.seq, 2);

        assert!(files.contains(MD5));
        assert!(!session.has_open_file());
        assert_eq!(std::fs::read(files.path_for(MD5)).unwrap(), payload);
    }

    #[test]
    fn known_digest_completes_without_opening() {
        let (_dir, files) = store();
        std::fs::write(files.path_for(MD5), b"already here").unwrap();
        files.insert(MD5);

        let mut session = FileSession::new();
        let resp = run_one(
            &mut session,
            &files,
            Request::upload(9, MD5, 0, 12, Bytes::new()),
        )
        .unwrap();
        assert_eq!(resp.code, TransferCode::Complete);
        assert_eq!(resp.offset, 12);
        assert_eq!(resp.seq, 9);
        assert!(!session.has_open_file());
    }

    #[test]
    fn empty_digest_fails_the_session() {
        let (_dir, files) = store();
        let mut session = FileSession::new();
        let result = run(
            &mut session,
            &files,
            Request::upload(1, "", 0, 4, b"data".to_vec()),
        );
        assert!(matches!(result, Err(SessionError::EmptyDigest)));
    }

    #[test]
    fn second_digest_mid_upload_is_a_collision() {
        let (_dir, files) = store();
        let mut session = FileSession::new();
        run_one(
            &mut session,
            &files,
            Request::upload(1, MD5, 0, 100, vec![0u8; 10]),
        )
        .unwrap();

        let result = run(
            &mut session,
            &files,
            Request::upload(2, OTHER_MD5, 0, 100, vec![0u8; 10]),
        );
        assert!(matches!(result, Err(SessionError::TransferCollision)));
    }

    #[test]
    fn download_mid_upload_is_a_collision() {
        let (_dir, files) = store();
        std::fs::write(files.path_for(OTHER_MD5), b"stored").unwrap();
        files.insert(OTHER_MD5);

        let mut session = FileSession::new();
        run_one(
            &mut session,
            &files,
            Request::upload(1, MD5, 0, 100, vec![0u8; 10]),
        )
        .unwrap();

        let result = run(
            &mut session,
            &files,
            Request::download(2, OTHER_MD5, NetType::Broadband),
        );
        assert!(matches!(result, Err(SessionError::TransferCollision)));
    }

    #[test]
    fn resume_without_partial_file_fails() {
        let (_dir, files) = store();
        let mut session = FileSession::new();
        let result = run(
            &mut session,
            &files,
            Request::upload(1, MD5, 4096, 8192, vec![0u8; 4096]),
        );
        assert!(matches!(result, Err(SessionError::MissingUploadHandle)));
    }

    #[test]
    fn resume_after_reconnect_yields_identical_file() {
        let (_dir, files) = store();
        let payload: Vec<u8> = (0..600_000u32).map(|i| (i / 3) as u8).collect();
        let split = 300_000;

        let mut first = FileSession::new();
        let resp = run_one(
            &mut first,
            &files,
            Request::upload(1, MD5, 0, payload.len() as i64, payload[..split].to_vec()),
        )
        .unwrap();
        assert_eq!(resp.code, TransferCode::Progress);
        assert_eq!(resp.offset, split as i64);
        drop(first); // connection breaks

        let mut second = FileSession::new();
        let resp = run_one(
            &mut second,
            &files,
            Request::upload(
                2,
                MD5,
                split as i64,
                payload.len() as i64,
                payload[split..].to_vec(),
            ),
        )
        .unwrap();
        assert_eq!(resp.code, TransferCode::Complete);
        assert_eq!(std::fs::read(files.path_for(MD5)).unwrap(), payload);
    }

    #[test]
    fn download_of_unknown_digest_is_not_exist() {
        let (_dir, files) = store();
        let mut session = FileSession::new();
        let resp = run_one(
            &mut session,
            &files,
            Request::download(5, MD5, NetType::Broadband),
        )
        .unwrap();
        assert_eq!(resp.code, TransferCode::NotExist);
        assert_eq!(resp.offset, 0);
        assert_eq!(resp.file_size, 0);
        assert_eq!(resp.seq, 5);
    }

    #[test]
    fn cellular_download_chunks_200k_file() {
        let (_dir, files) = store();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 127) as u8).collect();
        std::fs::write(files.path_for(MD5), &payload).unwrap();
        files.insert(MD5);

        let mut session = FileSession::new();
        let mut received = Vec::new();
        let mut sizes = Vec::new();
        for seq in 0.. {
            let resp = run_one(
                &mut session,
                &files,
                Request::download(seq, MD5, NetType::Cellular),
            )
            .unwrap();
            assert_eq!(resp.file_size, payload.len() as i64);
            assert_eq!(resp.offset, received.len() as i64);
            sizes.push(resp.data.len());
            received.extend_from_slice(&resp.data);
            if resp.code == TransferCode::Complete {
                break;
            }
            assert_eq!(resp.code, TransferCode::Progress);
            assert_eq!(resp.data.len() as i64, CELLULAR_CHUNK);
        }
        assert_eq!(sizes, vec![65536, 65536, 65536, 3392]);
        assert_eq!(received, payload);
        assert!(!session.has_open_file());
    }

    #[test]
    fn empty_file_download_answers_unknown() {
        let (_dir, files) = store();
        std::fs::write(files.path_for(MD5), b"").unwrap();
        files.insert(MD5);

        let mut session = FileSession::new();
        let resp = run_one(
            &mut session,
            &files,
            Request::download(1, MD5, NetType::Broadband),
        )
        .unwrap();
        assert_eq!(resp.code, TransferCode::Unknown);
        assert!(!session.has_open_file());
    }

    #[test]
    fn repeated_filesystem_failure_fails_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileManager::open(dir.path().join("store")).unwrap();
        // Pull the store out from under the session.
        std::fs::remove_dir_all(files.base_dir()).unwrap();

        let mut session = FileSession::new();
        let resp = run_one(
            &mut session,
            &files,
            Request::upload(1, MD5, 0, 4, b"data".to_vec()),
        )
        .unwrap();
        assert_eq!(resp.code, TransferCode::Unknown);

        let result = run(
            &mut session,
            &files,
            Request::upload(2, MD5, 0, 4, b"data".to_vec()),
        );
        assert!(matches!(
            result,
            Err(SessionError::RepeatedFilesystemFailure(_))
        ));
    }

    #[test]
    fn frames_survive_arbitrary_segmentation() {
        let (_dir, files) = store();
        let mut session = FileSession::new();

        let mut wire = BytesMut::new();
        Request::upload(1, MD5, 0, 6, b"abc".to_vec()).encode_frame(&mut wire);
        Request::upload(2, MD5, 3, 6, b"def".to_vec()).encode_frame(&mut wire);

        // Feed the two requests one byte at a time.
        let mut buf = Buffer::new();
        let mut out = BytesMut::new();
        for &byte in wire.iter() {
            buf.append(&[byte]);
            session.process_buffer(&mut buf, &files, &mut out).unwrap();
        }

        let mut responses = Vec::new();
        let mut rest: &[u8] = &out;
        while let Some((body, consumed)) = split_frame(rest).unwrap() {
            responses.push(Response::decode(body).unwrap());
            rest = &rest[consumed..];
        }
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].code, TransferCode::Progress);
        assert_eq!(responses[0].seq, 1);
        assert_eq!(responses[1].code, TransferCode::Complete);
        assert_eq!(responses[1].seq, 2);
        assert_eq!(std::fs::read(files.path_for(MD5)).unwrap(), b"abcdef");
    }

    #[test]
    fn bad_frame_header_fails_the_session() {
        let (_dir, files) = store();
        let mut session = FileSession::new();

        let mut buf = Buffer::new();
        buf.append(&0i64.to_le_bytes());
        let mut out = BytesMut::new();
        let result = session.process_buffer(&mut buf, &files, &mut out);
        assert!(matches!(result, Err(SessionError::Frame(_))));
        assert!(out.is_empty());
    }
}
