//! rtpdump file format (`rtpplay`/`rtpdump` from rtptools)
//!
//! ```text
//! #!rtpplay1.0 <address>/<port>\n
//! start_sec:u32 start_usec:u32 source:u32 port:u16 padding:u16
//! { length:u16 plen:u16 offset_ms:u32 packet[length - 8] }*
//! ```
//!
//! All integers are big-endian. `plen` is 0 for RTCP records.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: &str = "#!rtpplay1.0";

const FILE_HEADER_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 8;
/// Longest first line accepted before giving up on the file
const MAX_LINE: usize = 256;

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpDumpHeader {
    pub source: SocketAddrV4,
    pub start: SystemTime,
}

impl RtpDumpHeader {
    pub fn new(source: SocketAddrV4) -> Self {
        Self {
            source,
            start: SystemTime::now(),
        }
    }
}

impl Default for RtpDumpHeader {
    fn default() -> Self {
        Self::new(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpDumpRecord {
    /// Time since the start of the recording
    pub offset: Duration,
    pub data: Bytes,
    pub is_rtcp: bool,
}

pub struct RtpDumpReader<R> {
    inner: R,
    header: RtpDumpHeader,
}

impl<R: AsyncBufRead + Unpin> RtpDumpReader<R> {
    /// Read and validate the file header
    pub async fn new(mut inner: R) -> io::Result<Self> {
        let mut line = Vec::new();
        (&mut inner).take(MAX_LINE as u64).read_until(b'\n', &mut line).await?;
        if line.last() != Some(&b'\n') {
            return Err(invalid("missing rtpdump header line"));
        }
        let line = String::from_utf8_lossy(&line);
        if !line.starts_with(MAGIC) {
            return Err(invalid(format!("not an rtpdump file: {}", line.trim_end())));
        }

        let mut raw = [0u8; FILE_HEADER_LEN];
        inner.read_exact(&mut raw).await?;
        let mut buf = &raw[..];
        let start_sec = buf.get_u32();
        let start_usec = buf.get_u32();
        let source = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();

        let start = UNIX_EPOCH + Duration::from_secs(start_sec as u64) + Duration::from_micros(start_usec as u64);
        Ok(Self {
            inner,
            header: RtpDumpHeader {
                source: SocketAddrV4::new(source, port),
                start,
            },
        })
    }

    pub fn header(&self) -> &RtpDumpHeader {
        &self.header
    }

    /// Next record, or `None` at a clean end of file
    pub async fn next_record(&mut self) -> io::Result<Option<RtpDumpRecord>> {
        let mut raw = [0u8; RECORD_HEADER_LEN];
        match self.inner.read_exact(&mut raw).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut buf = &raw[..];
        let length = buf.get_u16() as usize;
        let plen = buf.get_u16();
        let offset = Duration::from_millis(buf.get_u32() as u64);
        if length < RECORD_HEADER_LEN {
            return Err(invalid(format!("record length {length} shorter than its header")));
        }

        let mut data = vec![0u8; length - RECORD_HEADER_LEN];
        self.inner.read_exact(&mut data).await?;
        Ok(Some(RtpDumpRecord {
            offset,
            data: Bytes::from(data),
            is_rtcp: plen == 0,
        }))
    }
}

pub struct RtpDumpWriter<W> {
    inner: W,
    records: u64,
}

impl<W: AsyncWrite + Unpin> RtpDumpWriter<W> {
    pub async fn new(mut inner: W, header: &RtpDumpHeader) -> io::Result<Self> {
        let since_epoch = header.start.duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(format!("{MAGIC} {}/{}\n", header.source.ip(), header.source.port()).as_bytes());
        buf.put_u32(since_epoch.as_secs() as u32);
        buf.put_u32(since_epoch.subsec_micros());
        buf.put_u32(u32::from(*header.source.ip()));
        buf.put_u16(header.source.port());
        buf.put_u16(0);
        inner.write_all(&buf).await?;
        Ok(Self { inner, records: 0 })
    }

    pub async fn write_record(&mut self, record: &RtpDumpRecord) -> io::Result<()> {
        let length = record.data.len() + RECORD_HEADER_LEN;
        let length = u16::try_from(length).map_err(|_| invalid(format!("packet of {length} bytes too large")))?;
        let plen = if record.is_rtcp { 0 } else { record.data.len() as u16 };

        let mut buf = BytesMut::with_capacity(length as usize);
        buf.put_u16(length);
        buf.put_u16(plen);
        buf.put_u32(record.offset.as_millis().min(u32::MAX as u128) as u32);
        buf.put_slice(&record.data);
        self.inner.write_all(&buf).await?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}
