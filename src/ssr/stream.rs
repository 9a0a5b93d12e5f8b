use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::cipher::StreamCipher;
use super::obfs::Obfs;
use super::protocol::Protocol;

const READ_CHUNK: usize = 16 * 1024;
/// Largest plaintext slice encoded per `poll_write`
const WRITE_CHUNK: usize = 32 * 1024;

/// Shadowsocksr stream: protocol -> cipher -> obfs on the way out, the reverse
/// on the way in.
pub struct SsrStream<S> {
    inner: S,
    cipher: StreamCipher,
    obfs: Box<dyn Obfs>,
    protocol: Box<dyn Protocol>,
    /// decoded plaintext not yet handed to the reader
    read_buf: BytesMut,
    scratch: Box<[u8]>,
    eof: bool,
    /// encoded bytes not yet accepted by `inner`
    write_buf: BytesMut,
}

impl<S> SsrStream<S> {
    pub fn new(inner: S, cipher: StreamCipher, obfs: Box<dyn Obfs>, protocol: Box<dyn Protocol>) -> Self {
        Self {
            inner,
            cipher,
            obfs,
            protocol,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            eof: false,
            write_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn encode(&mut self, data: &[u8]) -> io::Result<()> {
        let mut framed = BytesMut::with_capacity(data.len() + 64);
        self.protocol.pre_encrypt(data, &mut framed)?;
        let mut sealed = BytesMut::with_capacity(framed.len() + 16);
        self.cipher.encrypt(&framed, &mut sealed);
        self.obfs.encode(&sealed, &mut self.write_buf);
        Ok(())
    }

    fn decode(&mut self, n: usize) -> io::Result<()> {
        let mut unwrapped = BytesMut::with_capacity(n);
        self.obfs.decode(&self.scratch[..n], &mut unwrapped)?;
        let mut opened = BytesMut::with_capacity(unwrapped.len());
        self.cipher
            .decrypt(&unwrapped, &mut opened)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.protocol.post_decrypt(&opened, &mut self.read_buf)
    }
}

impl<S: AsyncWrite + Unpin> SsrStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SsrStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // a chunk may decode to nothing (obfs header, partial IV or packet)
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let mut raw = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            let n = raw.filled().len();
            if n == 0 {
                this.eof = true;
                continue;
            }
            this.decode(n)?;
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SsrStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        let n = buf.len().min(WRITE_CHUNK);
        this.encode(&buf[..n])?;
        // accepted once encoded; anything left is pushed by the next write or flush
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
