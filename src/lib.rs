//! Stream multiplexing over a single reliable, ordered byte connection.
//!
//! A [`Session`] owns the underlying connection and carries any number of
//! independent bidirectional [`Stream`]s over it, framed with the smux wire
//! format (protocol versions 1 and 2).
//!
//! ```no_run
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> smux::Result<()> {
//! let conn = TcpStream::connect("127.0.0.1:9000").await?;
//! let session = smux::client(conn, smux::Config::default())?;
//!
//! let stream = session.open_stream().await?;
//! stream.send(b"hello").await?;
//!
//! let mut buf = [0u8; 1024];
//! let n = stream.recv(&mut buf).await?;
//! println!("{:?}", &buf[..n]);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
mod keepalive;
pub mod session;
mod shaper;
pub mod stream;
pub mod stream_id;

pub use codec::{encode_frame, Codec};
pub use command::Command;
pub use config::{Config, ConfigBuilder};
pub use error::{Result, SmuxError};
pub use frame::{Frame, HEADER_SIZE};
pub use session::Session;
pub use stream::{Stream, StreamState};
pub use stream_id::StreamIdGenerator;

use tokio::io::{AsyncRead, AsyncWrite};

/// Starts a client-side session over `transport`.
pub fn client<T>(transport: T, config: Config) -> Result<Session>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    Session::client(transport, config)
}

/// Starts a server-side session over `transport`.
pub fn server<T>(transport: T, config: Config) -> Result<Session>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    Session::server(transport, config)
}
