mod helpers;

#[cfg(test)]
mod tests {
    use super::helpers::{self, fakes::FakeMessageIO, next_message};
    use magnet_swarm::chunk::ChunkClaim;
    use magnet_swarm::config::{MAX_METADATA_SIZE, METADATA_BLOCK_SIZE};
    use magnet_swarm::coordinator::SessionCommand;
    use magnet_swarm::error::AppError;
    use magnet_swarm::peer_messages::{
        BitfieldMessage, ChokeMessage, HaveMessage, LOCAL_UT_METADATA_ID, MetadataResponse, PeerMessage,
        PieceMessage, UnchokeMessage, parse_extension_handshake, parse_metadata_message,
    };
    use magnet_swarm::peer_session::PeerSession;
    use magnet_swarm::traits::MessageIO;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const INFO_HASH: [u8; 20] = [5u8; 20];

    fn spawn_session(
        mut session: PeerSession,
        io: FakeMessageIO,
    ) -> JoinHandle<(PeerSession, anyhow::Result<()>)> {
        tokio::spawn(async move {
            let result = session.run_with_io(Box::new(io)).await;
            (session, result)
        })
    }

    async fn next_command(command_rx: &mut mpsc::Receiver<SessionCommand>) -> SessionCommand {
        timeout(Duration::from_secs(1), command_rx.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("command channel closed")
    }

    /// Skips the extension handshake and INTERESTED every session opens with.
    async fn skip_opening(remote: &mut FakeMessageIO) {
        assert!(matches!(
            next_message(remote).await,
            PeerMessage::Extended { extension_id: 0, .. }
        ));
        assert!(matches!(next_message(remote).await, PeerMessage::Interested(_)));
    }

    /// Unchokes the session and answers its claim with `claim`, returning
    /// the REQUEST it sends.
    async fn unchoke_and_claim(
        remote: &mut FakeMessageIO,
        command_rx: &mut mpsc::Receiver<SessionCommand>,
        claim: ChunkClaim,
    ) -> PeerMessage {
        remote
            .write_message(&PeerMessage::Bitfield(BitfieldMessage {
                bitfield: vec![true, true, false, false, false, false, false, false],
            }))
            .await
            .unwrap();
        remote
            .write_message(&PeerMessage::Unchoke(UnchokeMessage {}))
            .await
            .unwrap();

        match next_command(command_rx).await {
            SessionCommand::Claim { bitfield, reply } => {
                assert!(bitfield.has(0));
                assert!(bitfield.has(1));
                assert!(!bitfield.has(2));
                reply.send(Some(claim)).unwrap();
            }
            other => panic!("expected a claim, got {:?}", other),
        }

        next_message(remote).await
    }

    fn first_claim() -> ChunkClaim {
        ChunkClaim {
            piece_index: 0,
            chunk_index: 0,
            begin: 0,
            length: 400,
        }
    }

    #[tokio::test]
    async fn test_session_opens_with_extension_handshake_then_interested() {
        let parts = helpers::make_handle(false);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);

        match next_message(&mut remote).await {
            PeerMessage::Extended {
                extension_id,
                payload,
            } => {
                assert_eq!(extension_id, 0);
                let handshake = parse_extension_handshake(&payload).unwrap();
                assert_eq!(handshake.ut_metadata, Some(LOCAL_UT_METADATA_ID));
                assert_eq!(handshake.metadata_size, None);
            }
            other => panic!("expected the extension handshake, got {:?}", other),
        }
        assert!(matches!(next_message(&mut remote).await, PeerMessage::Interested(_)));

        shutdown_tx.send(()).unwrap();
        let (session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(session.is_choked());
    }

    #[tokio::test]
    async fn test_session_assembles_and_delivers_metadata() {
        let mut parts = helpers::make_handle(false);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);
        skip_opening(&mut remote).await;

        let metadata = helpers::content(METADATA_BLOCK_SIZE + 100);
        remote
            .write_message(&helpers::peer_extension_handshake(3, metadata.len()))
            .await
            .unwrap();

        for expected_piece in 0..2 {
            match next_message(&mut remote).await {
                PeerMessage::Extended {
                    extension_id,
                    payload,
                } => {
                    assert_eq!(extension_id, 3, "requests use the peer's ut_metadata id");
                    assert_eq!(
                        parse_metadata_message(&payload).unwrap(),
                        MetadataResponse::Request {
                            piece: expected_piece
                        }
                    );
                }
                other => panic!("expected a metadata request, got {:?}", other),
            }
        }

        // Out of order on purpose.
        remote
            .write_message(&helpers::metadata_data(
                1,
                metadata.len(),
                &metadata[METADATA_BLOCK_SIZE..],
            ))
            .await
            .unwrap();
        remote
            .write_message(&helpers::metadata_data(
                0,
                metadata.len(),
                &metadata[..METADATA_BLOCK_SIZE],
            ))
            .await
            .unwrap();

        let delivered = timeout(Duration::from_secs(1), parts.metadata_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, metadata);

        drop(remote);
        let (_session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AppError>(),
            Some(AppError::PeerDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_session_does_not_claim_before_metadata_is_ready() {
        let mut parts = helpers::make_handle(false);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let _task = spawn_session(session, local);
        skip_opening(&mut remote).await;

        remote
            .write_message(&PeerMessage::Unchoke(UnchokeMessage {}))
            .await
            .unwrap();

        let early = timeout(Duration::from_millis(100), parts.command_rx.recv()).await;
        assert!(early.is_err(), "no claim before metadata is loaded");

        parts.metadata_ready_tx.send_replace(true);

        match next_command(&mut parts.command_rx).await {
            SessionCommand::Claim { reply, .. } => reply.send(Some(first_claim())).unwrap(),
            other => panic!("expected a claim, got {:?}", other),
        }
        assert!(matches!(next_message(&mut remote).await, PeerMessage::Request(_)));
    }

    #[tokio::test]
    async fn test_session_delivers_matching_block_and_claims_again() {
        let mut parts = helpers::make_handle(true);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);
        skip_opening(&mut remote).await;

        match unchoke_and_claim(&mut remote, &mut parts.command_rx, first_claim()).await {
            PeerMessage::Request(request) => {
                assert_eq!(request.piece_index, 0);
                assert_eq!(request.begin, 0);
                assert_eq!(request.length, 400);
            }
            other => panic!("expected a request, got {:?}", other),
        }

        let block = helpers::content(400);
        remote
            .write_message(&PeerMessage::Piece(PieceMessage {
                piece_index: 0,
                begin: 0,
                block: block.clone(),
            }))
            .await
            .unwrap();

        match next_command(&mut parts.command_rx).await {
            SessionCommand::Deliver { claim, data } => {
                assert_eq!(claim, first_claim());
                assert_eq!(data, block);
            }
            other => panic!("expected a delivery, got {:?}", other),
        }

        match next_command(&mut parts.command_rx).await {
            SessionCommand::Claim { reply, .. } => reply.send(None).unwrap(),
            other => panic!("expected a second claim, got {:?}", other),
        }

        shutdown_tx.send(()).unwrap();
        let (session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(session.claimed(), None);
    }

    #[tokio::test]
    async fn test_session_rejects_block_with_wrong_begin() {
        let mut parts = helpers::make_handle(true);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);
        skip_opening(&mut remote).await;
        unchoke_and_claim(&mut remote, &mut parts.command_rx, first_claim()).await;

        remote
            .write_message(&PeerMessage::Piece(PieceMessage {
                piece_index: 0,
                begin: 400,
                block: vec![0u8; 400],
            }))
            .await
            .unwrap();

        match next_command(&mut parts.command_rx).await {
            SessionCommand::Release { claim } => assert_eq!(claim, first_claim()),
            other => panic!("expected a release, got {:?}", other),
        }

        let (session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AppError>(),
            Some(AppError::WrongPiece {
                piece_index: 0,
                expected_begin: 0,
                got_begin: 400
            })
        ));
        assert_eq!(session.claimed(), None);

        // Released exactly once.
        assert!(parts.command_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_rejects_block_with_wrong_length() {
        let mut parts = helpers::make_handle(true);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);
        skip_opening(&mut remote).await;
        unchoke_and_claim(&mut remote, &mut parts.command_rx, first_claim()).await;

        remote
            .write_message(&PeerMessage::Piece(PieceMessage {
                piece_index: 0,
                begin: 0,
                block: vec![0u8; 10],
            }))
            .await
            .unwrap();

        assert!(matches!(
            next_command(&mut parts.command_rx).await,
            SessionCommand::Release { .. }
        ));

        let (_session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(
            result.unwrap_err().downcast_ref::<AppError>(),
            Some(AppError::UnexpectedBlockLength {
                expected: 400,
                got: 10
            })
        ));
    }

    #[tokio::test]
    async fn test_choke_releases_claim_and_keeps_session_open() {
        let mut parts = helpers::make_handle(true);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);
        skip_opening(&mut remote).await;
        unchoke_and_claim(&mut remote, &mut parts.command_rx, first_claim()).await;

        remote
            .write_message(&PeerMessage::Choke(ChokeMessage {}))
            .await
            .unwrap();

        match next_command(&mut parts.command_rx).await {
            SessionCommand::Release { claim } => assert_eq!(claim, first_claim()),
            other => panic!("expected a release, got {:?}", other),
        }

        let late = timeout(Duration::from_millis(100), parts.command_rx.recv()).await;
        assert!(late.is_err(), "a choked session must not claim");

        shutdown_tx.send(()).unwrap();
        let (session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(session.is_choked());
        assert_eq!(session.claimed(), None);
    }

    #[tokio::test]
    async fn test_disconnect_releases_outstanding_claim() {
        let mut parts = helpers::make_handle(true);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);
        skip_opening(&mut remote).await;
        unchoke_and_claim(&mut remote, &mut parts.command_rx, first_claim()).await;

        drop(remote);

        match next_command(&mut parts.command_rx).await {
            SessionCommand::Release { claim } => assert_eq!(claim, first_claim()),
            other => panic!("expected a release, got {:?}", other),
        }

        let (_session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unsolicited_block_is_dropped() {
        let mut parts = helpers::make_handle(true);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);
        skip_opening(&mut remote).await;

        remote
            .write_message(&PeerMessage::Piece(PieceMessage {
                piece_index: 3,
                begin: 0,
                block: vec![1u8; 16],
            }))
            .await
            .unwrap();

        let nothing = timeout(Duration::from_millis(100), parts.command_rx.recv()).await;
        assert!(nothing.is_err());

        shutdown_tx.send(()).unwrap();
        let (_session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_have_beyond_any_bitfield_ends_session() {
        let mut parts = helpers::make_handle(true);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);
        skip_opening(&mut remote).await;

        for piece_index in [3, u32::MAX] {
            remote
                .write_message(&PeerMessage::Have(HaveMessage { piece_index }))
                .await
                .unwrap();
        }

        let (session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(
            result.unwrap_err().downcast_ref::<AppError>(),
            Some(AppError::PieceIndexOutOfRange { index, .. }) if *index == u32::MAX as usize
        ));
        assert!(session.bitfield().has(3));
        assert_eq!(session.bitfield().len(), 4);

        // Still choked, so nothing was claimed.
        assert!(parts.command_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_metadata_size_ends_session() {
        let parts = helpers::make_handle(false);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);
        skip_opening(&mut remote).await;

        remote
            .write_message(&helpers::peer_extension_handshake(3, MAX_METADATA_SIZE + 1))
            .await
            .unwrap();

        let (_session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(
            result.unwrap_err().downcast_ref::<AppError>(),
            Some(AppError::MetadataTooLarge { .. })
        ));

        // No metadata request went out before the session closed.
        assert!(remote.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deeply_nested_extension_payload_ends_session() {
        let parts = helpers::make_handle(false);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = helpers::make_session(INFO_HASH, parts.handle.clone(), shutdown_rx);

        let (local, mut remote) = FakeMessageIO::pair();
        let task = spawn_session(session, local);
        skip_opening(&mut remote).await;

        remote
            .write_message(&PeerMessage::Extended {
                extension_id: 0,
                payload: vec![b'l'; 26_000],
            })
            .await
            .unwrap();

        let (_session, result) = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(
            result.unwrap_err().downcast_ref::<AppError>(),
            Some(AppError::InvalidBencode(_))
        ));
    }
}
