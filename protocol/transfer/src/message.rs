//! Request/response messages carried inside frames.

use bytes::{Bytes, BytesMut};

use crate::codec::{CodecError, Reader, Writer};
use crate::frame::write_frame;

/// Command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Cmd {
    UploadReq = 1,
    UploadResp = 2,
    DownloadReq = 3,
    DownloadResp = 4,
}

impl Cmd {
    pub fn from_i32(v: i32) -> Option<Cmd> {
        match v {
            1 => Some(Cmd::UploadReq),
            2 => Some(Cmd::UploadResp),
            3 => Some(Cmd::DownloadReq),
            4 => Some(Cmd::DownloadResp),
            _ => None,
        }
    }
}

/// Transfer status carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TransferCode {
    Unknown = 0,
    Progress = 1,
    Complete = 2,
    NotExist = 3,
}

impl TransferCode {
    pub fn from_i32(v: i32) -> Option<TransferCode> {
        match v {
            0 => Some(TransferCode::Unknown),
            1 => Some(TransferCode::Progress),
            2 => Some(TransferCode::Complete),
            3 => Some(TransferCode::NotExist),
            _ => None,
        }
    }
}

/// Client network class, driving the download chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum NetType {
    #[default]
    Broadband = 0,
    Cellular = 1,
}

impl NetType {
    /// Unrecognized values read as broadband.
    pub fn from_i32(v: i32) -> NetType {
        if v == NetType::Cellular as i32 {
            NetType::Cellular
        } else {
            NetType::Broadband
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported command {0}")]
    UnknownCmd(i32),
    #[error("request carries a response command {0:?}")]
    NotARequest(Cmd),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A decoded client request.
///
/// `net_type` is present exactly when `cmd` is `DownloadReq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: Cmd,
    pub seq: i32,
    pub file_md5: String,
    pub offset: i64,
    pub file_size: i64,
    pub data: Bytes,
    pub net_type: Option<NetType>,
}

impl Request {
    pub fn upload(
        seq: i32,
        file_md5: &str,
        offset: i64,
        file_size: i64,
        chunk: impl Into<Bytes>,
    ) -> Request {
        Request {
            cmd: Cmd::UploadReq,
            seq,
            file_md5: file_md5.to_string(),
            offset,
            file_size,
            data: chunk.into(),
            net_type: None,
        }
    }

    pub fn download(seq: i32, file_md5: &str, net_type: NetType) -> Request {
        Request {
            cmd: Cmd::DownloadReq,
            seq,
            file_md5: file_md5.to_string(),
            offset: 0,
            file_size: 0,
            data: Bytes::new(),
            net_type: Some(net_type),
        }
    }

    /// Decode one request body. Every field read is bounds-checked; any
    /// short read fails the whole message.
    pub fn decode(body: &[u8]) -> Result<Request, DecodeError> {
        let mut r = Reader::new(body);
        let raw_cmd = r.read_i32()?;
        let cmd = Cmd::from_i32(raw_cmd).ok_or(DecodeError::UnknownCmd(raw_cmd))?;
        if !matches!(cmd, Cmd::UploadReq | Cmd::DownloadReq) {
            return Err(DecodeError::NotARequest(cmd));
        }
        let seq = r.read_i32()?;
        let file_md5 = r.read_str()?;
        let offset = r.read_i64()?;
        let file_size = r.read_i64()?;
        let data = Bytes::copy_from_slice(r.read_bytes()?);
        let net_type = if cmd == Cmd::DownloadReq {
            Some(NetType::from_i32(r.read_i32()?))
        } else {
            None
        };
        Ok(Request {
            cmd,
            seq,
            file_md5,
            offset,
            file_size,
            data,
            net_type,
        })
    }

    /// Encode the request body and wrap it in a frame. Used by clients and
    /// tests; the server only decodes requests.
    pub fn encode_frame(&self, out: &mut BytesMut) {
        let mut body = BytesMut::new();
        let mut w = Writer::new(&mut body);
        w.put_i32(self.cmd as i32);
        w.put_i32(self.seq);
        w.put_str(&self.file_md5);
        w.put_i64(self.offset);
        w.put_i64(self.file_size);
        w.put_bytes(&self.data);
        if self.cmd == Cmd::DownloadReq {
            w.put_i32(self.net_type.unwrap_or_default() as i32);
        }
        write_frame(&body, out);
    }
}

/// A server response. `seq` echoes the request's sequence number verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub cmd: Cmd,
    pub seq: i32,
    pub code: TransferCode,
    pub file_md5: String,
    pub offset: i64,
    pub file_size: i64,
    pub data: Bytes,
}

impl Response {
    /// Encode the response body and wrap it in a frame.
    pub fn encode_frame(&self, out: &mut BytesMut) {
        let mut body = BytesMut::new();
        let mut w = Writer::new(&mut body);
        w.put_i32(self.cmd as i32);
        w.put_i32(self.seq);
        w.put_i32(self.code as i32);
        w.put_str(&self.file_md5);
        w.put_i64(self.offset);
        w.put_i64(self.file_size);
        w.put_bytes(&self.data);
        write_frame(&body, out);
    }

    /// Decode one response body (the client half; exercised by tests).
    pub fn decode(body: &[u8]) -> Result<Response, DecodeError> {
        let mut r = Reader::new(body);
        let raw_cmd = r.read_i32()?;
        let cmd = Cmd::from_i32(raw_cmd).ok_or(DecodeError::UnknownCmd(raw_cmd))?;
        let seq = r.read_i32()?;
        let raw_code = r.read_i32()?;
        let code = TransferCode::from_i32(raw_code).unwrap_or(TransferCode::Unknown);
        let file_md5 = r.read_str()?;
        let offset = r.read_i64()?;
        let file_size = r.read_i64()?;
        let data = Bytes::copy_from_slice(r.read_bytes()?);
        Ok(Response {
            cmd,
            seq,
            code,
            file_md5,
            offset,
            file_size,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::split_frame;

    const MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn upload_request_round_trip() {
        let req = Request::upload(3, MD5, 1024, 4096, b"chunk-bytes".as_ref());
        let mut wire = BytesMut::new();
        req.encode_frame(&mut wire);

        let (body, consumed) = split_frame(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(Request::decode(body).unwrap(), req);
    }

    #[test]
    fn download_request_carries_net_type() {
        let req = Request::download(9, MD5, NetType::Cellular);
        let mut wire = BytesMut::new();
        req.encode_frame(&mut wire);

        let (body, _) = split_frame(&wire).unwrap().unwrap();
        let decoded = Request::decode(body).unwrap();
        assert_eq!(decoded.net_type, Some(NetType::Cellular));
    }

    #[test]
    fn upload_request_has_no_net_type() {
        let req = Request::upload(1, MD5, 0, 1, b"x".as_ref());
        let mut wire = BytesMut::new();
        req.encode_frame(&mut wire);
        let (body, _) = split_frame(&wire).unwrap().unwrap();
        assert_eq!(Request::decode(body).unwrap().net_type, None);
    }

    #[test]
    fn unknown_net_type_reads_as_broadband() {
        let mut body = BytesMut::new();
        let mut w = Writer::new(&mut body);
        w.put_i32(Cmd::DownloadReq as i32);
        w.put_i32(0);
        w.put_str(MD5);
        w.put_i64(0);
        w.put_i64(0);
        w.put_bytes(b"");
        w.put_i32(77);
        assert_eq!(
            Request::decode(&body).unwrap().net_type,
            Some(NetType::Broadband)
        );
    }

    #[test]
    fn unknown_cmd_is_rejected() {
        let mut body = BytesMut::new();
        Writer::new(&mut body).put_i32(99);
        assert_eq!(Request::decode(&body), Err(DecodeError::UnknownCmd(99)));
    }

    #[test]
    fn response_cmd_in_a_request_is_rejected() {
        let mut body = BytesMut::new();
        Writer::new(&mut body).put_i32(Cmd::UploadResp as i32);
        assert_eq!(
            Request::decode(&body),
            Err(DecodeError::NotARequest(Cmd::UploadResp))
        );
    }

    #[test]
    fn truncated_request_is_rejected() {
        let req = Request::upload(1, MD5, 0, 10, b"0123456789".as_ref());
        let mut wire = BytesMut::new();
        req.encode_frame(&mut wire);
        let (body, _) = split_frame(&wire).unwrap().unwrap();
        // Drop the tail of the data string inside the body.
        let truncated = &body[..body.len() - 3];
        assert!(matches!(
            Request::decode(truncated),
            Err(DecodeError::Codec(_))
        ));
    }

    #[test]
    fn download_request_missing_net_type_is_rejected() {
        let mut body = BytesMut::new();
        let mut w = Writer::new(&mut body);
        w.put_i32(Cmd::DownloadReq as i32);
        w.put_i32(0);
        w.put_str(MD5);
        w.put_i64(0);
        w.put_i64(0);
        w.put_bytes(b"");
        assert!(matches!(
            Request::decode(&body),
            Err(DecodeError::Codec(CodecError::Underflow { .. }))
        ));
    }

    #[test]
    fn response_round_trip() {
        let resp = Response {
            cmd: Cmd::DownloadResp,
            seq: 12,
            code: TransferCode::Progress,
            file_md5: MD5.to_string(),
            offset: 65536,
            file_size: 200_000,
            data: Bytes::from_static(b"partial"),
        };
        let mut wire = BytesMut::new();
        resp.encode_frame(&mut wire);

        let (body, consumed) = split_frame(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(Response::decode(body).unwrap(), resp);
    }

    #[test]
    fn seq_echo_is_preserved() {
        for seq in [0, 1, -7, i32::MAX] {
            let resp = Response {
                cmd: Cmd::UploadResp,
                seq,
                code: TransferCode::Complete,
                file_md5: MD5.to_string(),
                offset: 0,
                file_size: 0,
                data: Bytes::new(),
            };
            let mut wire = BytesMut::new();
            resp.encode_frame(&mut wire);
            let (body, _) = split_frame(&wire).unwrap().unwrap();
            assert_eq!(Response::decode(body).unwrap().seq, seq);
        }
    }
}
