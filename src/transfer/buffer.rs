//! 传输缓冲区
//! 接收 / 发送缓冲区以 trait 对象形式持有，多路复用器只按地址识别它们

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use bytes::{BufMut, BytesMut};

use crate::common::error::HookError;
use crate::engine::SeekFlow;

/// 接收缓冲区：引擎收到的响应体写入这里
pub trait ReceiveBuffer {
    /// 写入一段数据，返回实际写入的字节数；少于输入长度视为中止
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, HookError>;
}

/// 发送缓冲区：上传数据从这里读取
pub trait TransmitBuffer {
    /// 读取数据到 `out`，返回 0 表示数据已读完
    fn read_chunk(&mut self, out: &mut [u8]) -> Result<usize, HookError>;

    /// 重新定位读取位置
    fn seek_to(&mut self, _pos: SeekFrom) -> Result<SeekFlow, HookError> {
        Ok(SeekFlow::CantSeek)
    }

    /// 已知的总大小
    fn size(&self) -> Option<u64> {
        None
    }
}

/// 类型擦除后的共享接收缓冲区
pub type SharedRx = Rc<RefCell<dyn ReceiveBuffer>>;
/// 类型擦除后的共享发送缓冲区
pub type SharedTx = Rc<RefCell<dyn TransmitBuffer>>;

/// 缓冲区地址，用于在拥有者集合中匹配条目
pub(crate) fn addr<T: ?Sized>(rc: &Rc<RefCell<T>>) -> *const () {
    Rc::as_ptr(rc) as *const ()
}

impl ReceiveBuffer for Vec<u8> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, HookError> {
        self.extend_from_slice(chunk);
        Ok(chunk.len())
    }
}

impl ReceiveBuffer for BytesMut {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, HookError> {
        self.put_slice(chunk);
        Ok(chunk.len())
    }
}

/// 丢弃所有接收数据，也不提供任何上传数据
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBuffer;

impl ReceiveBuffer for NullBuffer {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, HookError> {
        Ok(chunk.len())
    }
}

impl TransmitBuffer for NullBuffer {
    fn read_chunk(&mut self, _out: &mut [u8]) -> Result<usize, HookError> {
        Ok(0)
    }

    fn size(&self) -> Option<u64> {
        Some(0)
    }
}

/// 把接收数据转发给任意 `Write`（文件、套接字等）
#[derive(Debug)]
pub struct WriteSink<W: Write>(pub W);

impl<W: Write> WriteSink<W> {
    pub fn into_inner(self) -> W {
        self.0
    }
}

impl<W: Write> ReceiveBuffer for WriteSink<W> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, HookError> {
        self.0.write_all(chunk)?;
        Ok(chunk.len())
    }
}

/// 内存中的上传数据，带读取游标
#[derive(Debug, Clone)]
pub struct Payload<T: AsRef<[u8]>> {
    data: T,
    position: usize,
}

impl<T: AsRef<[u8]>> Payload<T> {
    pub fn new(data: T) -> Self {
        Self { data, position: 0 }
    }

    /// 当前读取位置
    pub fn position(&self) -> usize {
        self.position
    }

    /// 剩余未读字节
    pub fn remaining(&self) -> &[u8] {
        &self.data.as_ref()[self.position..]
    }

    pub fn get_ref(&self) -> &T {
        &self.data
    }
}

impl<T: AsRef<[u8]>> TransmitBuffer for Payload<T> {
    fn read_chunk(&mut self, out: &mut [u8]) -> Result<usize, HookError> {
        let remaining = self.remaining();
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    fn seek_to(&mut self, pos: SeekFrom) -> Result<SeekFlow, HookError> {
        let len = self.data.as_ref().len() as i128;
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(delta) => self.position as i128 + i128::from(delta),
            SeekFrom::End(delta) => len + i128::from(delta),
        };
        // 越界定位使传输失败
        if target < 0 || target > len {
            return Ok(SeekFlow::Fail);
        }
        self.position = target as usize;
        Ok(SeekFlow::Ok)
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.as_ref().len() as u64)
    }
}

/// 从任意 `Read + Seek` 读取上传数据
#[derive(Debug)]
pub struct ReadSource<R: Read + Seek> {
    inner: R,
    len: Option<u64>,
}

impl<R: Read + Seek> ReadSource<R> {
    /// 创建数据源，通过定位到末尾计算总长度后回到当前位置
    pub fn new(mut inner: R) -> std::io::Result<Self> {
        let current = inner.stream_position()?;
        let end = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(current))?;
        Ok(Self {
            inner,
            len: Some(end.saturating_sub(current)),
        })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> TransmitBuffer for ReadSource<R> {
    fn read_chunk(&mut self, out: &mut [u8]) -> Result<usize, HookError> {
        Ok(self.inner.read(out)?)
    }

    fn seek_to(&mut self, pos: SeekFrom) -> Result<SeekFlow, HookError> {
        match self.inner.seek(pos) {
            Ok(_) => Ok(SeekFlow::Ok),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(SeekFlow::Fail),
            Err(err) => Err(err.into()),
        }
    }

    fn size(&self) -> Option<u64> {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_payload_reads_in_chunks() {
        let mut payload = Payload::new(b"abcdef".to_vec());
        let mut out = [0u8; 4];
        assert_eq!(payload.read_chunk(&mut out).unwrap(), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(payload.read_chunk(&mut out).unwrap(), 2);
        assert_eq!(&out[..2], b"ef");
        assert_eq!(payload.read_chunk(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_payload_seek_semantics() {
        let mut payload = Payload::new("0123456789");
        assert_eq!(payload.seek_to(SeekFrom::Start(4)).unwrap(), SeekFlow::Ok);
        assert_eq!(payload.position(), 4);
        assert_eq!(payload.seek_to(SeekFrom::Current(3)).unwrap(), SeekFlow::Ok);
        assert_eq!(payload.position(), 7);
        assert_eq!(payload.seek_to(SeekFrom::End(-2)).unwrap(), SeekFlow::Ok);
        assert_eq!(payload.remaining(), b"89");

        assert_eq!(payload.seek_to(SeekFrom::End(1)).unwrap(), SeekFlow::Fail);
        assert_eq!(payload.seek_to(SeekFrom::Current(-20)).unwrap(), SeekFlow::Fail);
        // 失败的定位不移动游标
        assert_eq!(payload.position(), 8);
    }

    #[test]
    fn test_read_source_size() {
        let mut cursor = Cursor::new(vec![1u8; 10]);
        cursor.set_position(3);
        let mut source = ReadSource::new(cursor).unwrap();
        assert_eq!(source.size(), Some(7));

        let mut out = [0u8; 16];
        assert_eq!(source.read_chunk(&mut out).unwrap(), 7);
        assert_eq!(source.seek_to(SeekFrom::Start(0)).unwrap(), SeekFlow::Ok);
        assert_eq!(source.read_chunk(&mut out).unwrap(), 10);
    }

    #[test]
    fn test_receive_shapes() {
        let mut vec = Vec::new();
        vec.write_chunk(b"ab").unwrap();
        assert_eq!(vec, b"ab");

        let mut bytes = BytesMut::new();
        bytes.write_chunk(b"cd").unwrap();
        assert_eq!(&bytes[..], b"cd");

        let mut sink = WriteSink(Vec::new());
        sink.write_chunk(b"ef").unwrap();
        assert_eq!(sink.into_inner(), b"ef");

        assert_eq!(NullBuffer.write_chunk(b"gh").unwrap(), 2);
    }

    #[test]
    fn test_erased_addresses_match() {
        let typed = Rc::new(RefCell::new(Vec::<u8>::new()));
        let erased: SharedRx = typed.clone();
        assert_eq!(addr(&typed), addr(&erased));

        let other: SharedRx = Rc::new(RefCell::new(Vec::<u8>::new()));
        assert_ne!(addr(&typed), addr(&other));
    }
}
