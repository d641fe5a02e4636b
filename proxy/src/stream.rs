// Copyright the edge-router authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The accepted-connection wrapper: either a plain TCP stream or a TLS
//! stream terminated on top of one, behind a single `AsyncRead +
//! AsyncWrite` type so the proxy engine doesn't need to care which.

use std::io::IoSlice;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub tls: bool,
}

pub struct Socket {
	pub info: ConnectionInfo,
	inner: SocketType,
}

impl Socket {
	pub fn from_tcp(stream: TcpStream) -> std::io::Result<Self> {
		stream.set_nodelay(true)?;
		let info = ConnectionInfo {
			peer_addr: stream.peer_addr()?,
			local_addr: stream.local_addr()?,
			tls: false,
		};
		Ok(Socket {
			info,
			inner: SocketType::Tcp(stream),
		})
	}

	pub fn into_parts(self) -> (ConnectionInfo, SocketType) {
		(self.info, self.inner)
	}

	pub fn from_tls(info: ConnectionInfo, tls: TlsStream<SocketType>) -> Self {
		Socket {
			info: ConnectionInfo { tls: true, ..info },
			inner: SocketType::Tls(Box::new(tls)),
		}
	}
}

pub enum SocketType {
	Tcp(TcpStream),
	Tls(Box<TlsStream<SocketType>>),
}

macro_rules! delegate {
	($self:ident, $method:ident $(, $arg:expr)*) => {
		match $self.get_mut() {
			SocketType::Tcp(s) => Pin::new(s).$method($($arg),*),
			SocketType::Tls(s) => Pin::new(s.as_mut()).$method($($arg),*),
		}
	};
}

impl AsyncRead for SocketType {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		delegate!(self, poll_read, cx, buf)
	}
}

impl AsyncWrite for SocketType {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		delegate!(self, poll_write, cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		delegate!(self, poll_flush, cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		delegate!(self, poll_shutdown, cx)
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<std::io::Result<usize>> {
		delegate!(self, poll_write_vectored, cx, bufs)
	}

	fn is_write_vectored(&self) -> bool {
		match self {
			SocketType::Tcp(s) => s.is_write_vectored(),
			SocketType::Tls(s) => s.is_write_vectored(),
		}
	}
}

impl AsyncRead for Socket {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for Socket {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}
