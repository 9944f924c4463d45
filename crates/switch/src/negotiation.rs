//! multistream-select 1.0 negotiation.
//!
//! The dialer side is the `multistream-select` crate, see [`select_protocol`];
//! the listener side is [`ProtocolMuxer`], which dispatches against the switch's
//! [`ProtocolTable`] and so supports custom matchers.
use std::{io, sync::Arc};

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use multistream_select::{dialer_select_proto, Version};
use parking_lot::Mutex;
use unsigned_varint::io::ReadError;

use crate::{
    errors::{BufferOverflow, Error, Result},
    stats::Meter,
    Connection, ProtocolTable, Stats,
};

const MSG_MULTISTREAM_1_0: &str = "/multistream/1.0.0";
const MSG_LS: &str = "ls";
const MSG_NA: &str = "na";

/// The max length of one multistream-select frame.
const MAX_FRAME_LEN: usize = (1 << 14) - 1;

/// Negotiate one of `protocols`, in order of preference, as the dialer of `conn`.
///
/// On success, returns the protocol the listener accepted; `conn` is then ready for that protocol.
pub async fn select_protocol<P, I>(conn: &mut Connection, protocols: P) -> Result<I>
where
    P: IntoIterator<Item = I>,
    I: AsRef<str>,
{
    let (protocol_id, _) = dialer_select_proto(conn, protocols, Version::V1).await?;

    Ok(protocol_id)
}

/// The terminal state of one listener-side negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiated {
    /// A table entry accepted the proposal and its handler ran.
    Dispatched(String),
    /// The remote closed the stream without proposing a registered protocol.
    Closed,
}

/// Listener-side negotiation bound to a protocol table.
///
/// Each call to [`handle`](Self::handle) runs one exchange:
/// `START -> AWAIT_PROPOSAL -> MATCHED -> DISPATCHED` or `AWAIT_PROPOSAL -> NO_MATCH -> CLOSED`.
#[derive(Clone)]
pub struct ProtocolMuxer {
    table: Arc<Mutex<ProtocolTable>>,
    stats: Option<Arc<Stats>>,
}

impl ProtocolMuxer {
    pub fn new(table: Arc<Mutex<ProtocolTable>>) -> Self {
        Self { table, stats: None }
    }

    /// Count the traffic of every dispatched connection under its negotiated protocol.
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Negotiate a protocol on `conn` and invoke the matching handler.
    ///
    /// Unknown proposals are answered with `na`, the remote may propose another one.
    /// Errors are scoped to this connection only.
    pub async fn handle(&self, mut conn: Connection) -> Result<Negotiated> {
        match read_message(&mut conn).await? {
            Some(header) if header == MSG_MULTISTREAM_1_0 => {}
            Some(header) => return Err(Error::InvalidHeader(header)),
            None => return Ok(Negotiated::Closed),
        }

        write_message(&mut conn, MSG_MULTISTREAM_1_0).await?;

        loop {
            let Some(proposed) = read_message(&mut conn).await? else {
                log::trace!("{:?}, closed by peer before negotiation", conn);
                return Ok(Negotiated::Closed);
            };

            // a dialer starting over after a refused negotiation resends the header.
            if proposed == MSG_MULTISTREAM_1_0 {
                write_message(&mut conn, MSG_MULTISTREAM_1_0).await?;
                continue;
            }

            if proposed == MSG_LS {
                let ids = self.table.lock().ids();

                write_protocols(&mut conn, &ids).await?;

                continue;
            }

            let entry = self.table.lock().find(&proposed);

            let Some(entry) = entry else {
                log::trace!("{:?}, protocol {} not available", conn, proposed);
                write_message(&mut conn, MSG_NA).await?;
                continue;
            };

            write_message(&mut conn, &proposed).await?;

            log::trace!("{:?}, negotiated {}", conn, proposed);

            let conn = match &self.stats {
                Some(stats) => conn.metered(Meter::protocol(stats.clone(), &proposed)),
                None => conn,
            };

            if let Err(err) = entry.handle(proposed.clone(), conn).await {
                log::error!("handle protocol {}, returns error: {}", proposed, err);
            }

            return Ok(Negotiated::Dispatched(proposed));
        }
    }
}

/// Read one newline terminated message, returns `None` on a clean EOF.
async fn read_message<R>(io: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let len = match unsigned_varint::aio::read_usize(&mut *io).await {
        Ok(len) => len,
        Err(ReadError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(Error::BufferOverflow(BufferOverflow::Negotiation(
            MAX_FRAME_LEN,
        )));
    }

    let mut buf = vec![0; len];

    io.read_exact(&mut buf).await?;

    if buf.pop() != Some(b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "multistream-select message without trailing newline",
        )
        .into());
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err).into())
}

async fn write_message<W>(io: &mut W, msg: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = Vec::with_capacity(msg.len() + 1);

    payload.extend_from_slice(msg.as_bytes());
    payload.push(b'\n');

    write_frame(io, &payload).await
}

/// The `ls` response: one frame of length prefixed protocol lines, closed by an empty line.
async fn write_protocols<W>(io: &mut W, ids: &[String]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut len_buf = unsigned_varint::encode::usize_buffer();

    let mut payload = vec![];

    for id in ids {
        payload.extend_from_slice(unsigned_varint::encode::usize(id.len() + 1, &mut len_buf));
        payload.extend_from_slice(id.as_bytes());
        payload.push(b'\n');
    }

    payload.push(b'\n');

    write_frame(io, &payload).await
}

async fn write_frame<W>(io: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut len_buf = unsigned_varint::encode::usize_buffer();

    let mut frame = unsigned_varint::encode::usize(payload.len(), &mut len_buf).to_vec();

    frame.extend_from_slice(payload);

    io.write_all(&frame).await?;
    io.flush().await?;

    Ok(())
}
