//! Session handshake and missing-set negotiation (client side).

use std::collections::HashSet;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, SyncError};
use crate::inventory::{compute_missing, MissingSet, SnapshotChain};
use crate::snapshot::SnapshotId;
use crate::streaming::protocol::{
    read_frame, send_frame, Error, Fatal, Hello, HelloFlags, MessageType, SnapshotsNeeded,
    SnapshotsPresent, PROTOCOL_VERSION,
};

/// What the negotiation settled on.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub missing: MissingSet,
    /// Local snapshots the server already holds.
    pub already_present: usize,
}

/// Exchange Hello frames. Returns the flags both sides agreed on.
pub async fn handshake<R, W>(reader: &mut R, writer: &mut W, flags: HelloFlags) -> Result<HelloFlags>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_frame(writer, &Hello::new(flags).encode()).await?;

    let (msg_type, payload) = read_frame(reader).await?;
    match msg_type {
        MessageType::Hello => {
            let hello = Hello::decode(payload)?;
            if hello.version != PROTOCOL_VERSION {
                return Err(SyncError::protocol(format!(
                    "server speaks protocol {}, we speak {}",
                    hello.version, PROTOCOL_VERSION
                )));
            }
            tracing::debug!(version = hello.version, flags = ?hello.flags, "Handshake complete");
            Ok(flags & hello.flags)
        }
        MessageType::Fatal => {
            let fatal = Fatal::decode(payload)?;
            Err(SyncError::protocol(format!(
                "server refused session: {}",
                fatal.message
            )))
        }
        other => Err(SyncError::protocol(format!(
            "Expected Hello, got {:?}",
            other
        ))),
    }
}

/// Ask the server which snapshots of `chain` it holds and work out what it is
/// missing.
pub async fn negotiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    chain: &SnapshotChain,
) -> Result<Negotiated>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = SnapshotsNeeded {
        subvolume: chain.subvolume().to_string(),
        snapshots: chain.ids().map(|id| id.to_string()).collect(),
    };
    send_frame(writer, &request.encode()).await?;

    let (msg_type, payload) = read_frame(reader).await?;
    let reply = match msg_type {
        MessageType::SnapshotsPresent => SnapshotsPresent::decode(payload)?,
        MessageType::Error => return Err(Error::decode(payload)?.into_sync_error()),
        other => {
            return Err(SyncError::protocol(format!(
                "Expected SnapshotsPresent, got {:?}",
                other
            )))
        }
    };

    let mut present = HashSet::with_capacity(reply.present.len());
    for id in &reply.present {
        let id: SnapshotId = id.parse()?;
        if !chain.contains(&id) {
            return Err(SyncError::protocol(format!(
                "server reported {} as present but it was never offered",
                id
            )));
        }
        present.insert(id);
    }
    let latest = reply
        .latest
        .as_deref()
        .map(str::parse::<SnapshotId>)
        .transpose()?;

    let remote = chain.reported_remote(&present, latest.as_ref());
    let missing = compute_missing(chain, &remote)?;

    tracing::info!(
        subvolume = %chain.subvolume(),
        local = chain.len(),
        present = present.len(),
        missing = missing.len(),
        "Negotiated missing snapshots"
    );

    Ok(Negotiated {
        already_present: chain.len() - missing.len(),
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::link_chain;
    use crate::streaming::protocol::ErrorCode;
    use chrono::{TimeZone, Utc};
    use tokio::io::{duplex, split};

    fn ids(n: usize) -> Vec<SnapshotId> {
        (0..n)
            .map(|i| {
                let at = Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap();
                SnapshotId::new("backup", at).unwrap()
            })
            .collect()
    }

    fn chain(ids: &[SnapshotId]) -> SnapshotChain {
        SnapshotChain::new("home", link_chain("home", ids.to_vec())).unwrap()
    }

    /// Answer one SnapshotsNeeded with a canned reply.
    async fn reply_with(reply: bytes::Bytes) -> (tokio::task::JoinHandle<SnapshotsNeeded>, impl AsyncRead + Unpin, impl AsyncWrite + Unpin) {
        let (client, server) = duplex(64 * 1024);
        let (client_r, client_w) = split(client);
        let handle = tokio::spawn(async move {
            let (mut r, mut w) = split(server);
            let (msg_type, payload) = read_frame(&mut r).await.unwrap();
            assert_eq!(msg_type, MessageType::SnapshotsNeeded);
            send_frame(&mut w, &reply).await.unwrap();
            SnapshotsNeeded::decode(payload).unwrap()
        });
        (handle, client_r, client_w)
    }

    #[tokio::test]
    async fn test_missing_suffix_after_present_prefix() {
        let local = ids(3);
        let reply = SnapshotsPresent {
            present: vec![local[0].to_string()],
            latest: Some(local[0].to_string()),
        };
        let (handle, mut r, mut w) = reply_with(reply.encode()).await;

        let negotiated = negotiate(&mut r, &mut w, &chain(&local)).await.unwrap();
        let request = handle.await.unwrap();

        assert_eq!(request.subvolume, "home");
        assert_eq!(request.snapshots.len(), 3);
        assert_eq!(negotiated.already_present, 1);
        assert_eq!(negotiated.missing.ids(), local[1..].to_vec());
        assert_eq!(
            negotiated.missing.transfers()[0].base.as_ref(),
            Some(&local[0])
        );
    }

    #[tokio::test]
    async fn test_unknown_server_tail_is_divergence() {
        let local = ids(2);
        let foreign = ids(5).pop().unwrap();
        let reply = SnapshotsPresent {
            present: vec![local[0].to_string()],
            latest: Some(foreign.to_string()),
        };
        let (_handle, mut r, mut w) = reply_with(reply.encode()).await;

        let err = negotiate(&mut r, &mut w, &chain(&local)).await.unwrap_err();
        assert!(matches!(err, SyncError::ChainDivergence { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_server_error_surfaces() {
        let reply = Error {
            code: ErrorCode::DriverFailure,
            message: "disk offline".into(),
        };
        let (_handle, mut r, mut w) = reply_with(reply.encode()).await;

        let err = negotiate(&mut r, &mut w, &chain(&ids(1))).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Remote {
                code: ErrorCode::DriverFailure,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_handshake_intersects_flags() {
        let (client, server) = duplex(4096);
        let (mut r, mut w) = split(client);
        tokio::spawn(async move {
            let (mut sr, mut sw) = split(server);
            read_frame(&mut sr).await.unwrap();
            send_frame(&mut sw, &Hello::new(HelloFlags::empty()).encode())
                .await
                .unwrap();
        });

        let flags = handshake(&mut r, &mut w, HelloFlags::COMPRESSION)
            .await
            .unwrap();
        assert!(flags.is_empty());
    }
}
