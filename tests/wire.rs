use std::collections::HashSet;

use rand::{rngs::OsRng, RngCore};
use tokio::time::Instant;

use gamestream::codec::{self, CodecError, DecryptedMessage, EncryptedPacket};
use gamestream::crypto::{Direction, PacketCipher, SessionKeys, IV_LEN, KEY_LEN};
use gamestream::events::{Event, RgbLedRequested};
use gamestream::messages::{self, ControlMessage, DecodeError, MessageKind};
use gamestream::session::{ControlRole, ControlSession, DEFAULT_KEEPALIVE_TIMEOUT};

fn random_keys() -> SessionKeys {
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut key);
    OsRng.fill_bytes(&mut iv);
    SessionKeys::new(key, iv)
}

#[test]
fn rgb_led_bytes_decode_to_an_event() {
    let message = messages::decode(0x5502, &[0x01, 0x00, 0x10, 0x20, 0x30]).unwrap();
    assert_eq!(
        message.into_event(3),
        Some(Event::RgbLedRequested(RgbLedRequested {
            session_id: 3,
            controller: 1,
            r: 0x10,
            g: 0x20,
            b: 0x30,
        }))
    );
}

#[test]
fn overlong_len_is_rejected_before_decryption() {
    let cipher = PacketCipher::new(random_keys());
    let packet = codec::seal(
        &cipher,
        Direction::ClientToHost,
        0,
        &ControlMessage::IdrFrame.encode(),
    )
    .unwrap();
    let mut bytes = packet.to_bytes().unwrap();
    let claimed = packet.len_field().unwrap() + 8;
    bytes[2..4].copy_from_slice(&claimed.to_le_bytes());

    assert_eq!(
        EncryptedPacket::parse(&bytes),
        Err(CodecError::Malformed("length exceeds datagram"))
    );
}

#[test]
fn every_sent_packet_uses_a_fresh_sequence_number() {
    let keys = random_keys();
    let mut host =
        ControlSession::new(1, keys.clone(), ControlRole::Host, DEFAULT_KEEPALIVE_TIMEOUT);
    let mut client = ControlSession::new(1, keys, ControlRole::Client, DEFAULT_KEEPALIVE_TIMEOUT);
    let ping = ControlMessage::PeriodicPing { payload: vec![0; 8] }.encode();

    let mut host_seqs = HashSet::new();
    let mut ciphertexts = HashSet::new();
    for _ in 0..256 {
        let from_host = host.encrypt(&ping).unwrap();
        let from_client = client.encrypt(&ping).unwrap();
        assert!(host_seqs.insert(from_host.seq));
        // Same key, same seq, same plaintext: only the direction keeps these apart.
        assert_eq!(from_host.seq, from_client.seq);
        assert_ne!(from_host.payload, from_client.payload);
        assert!(ciphertexts.insert(from_host.payload));
        assert!(ciphertexts.insert(from_client.payload));
    }
}

#[test]
fn any_tampering_fails_authentication() {
    let keys = random_keys();
    let mut client =
        ControlSession::new(9, keys.clone(), ControlRole::Client, DEFAULT_KEEPALIVE_TIMEOUT);
    let mut host = ControlSession::new(9, keys, ControlRole::Host, DEFAULT_KEEPALIVE_TIMEOUT);
    let packet = client
        .encrypt(&DecryptedMessage::new(0x5502, vec![1, 0, 9, 9, 9]))
        .unwrap();

    let mut seq_changed = packet.clone();
    seq_changed.seq += 1;
    let mut tag_changed = packet.clone();
    tag_changed.tag[15] ^= 0x40;
    let mut body_changed = packet.clone();
    body_changed.payload[0] ^= 0x01;

    for forged in [seq_changed, tag_changed, body_changed] {
        assert_eq!(
            host.decrypt(&forged, Instant::now()),
            Err(CodecError::AuthenticationFailed)
        );
    }
    assert_eq!(host.recv_seq_high_water(), None);
    assert!(host.decrypt(&packet, Instant::now()).is_ok());
}

#[test]
fn unknown_types_survive_the_codec_but_not_the_registry() {
    let cipher = PacketCipher::new(random_keys());
    let message = DecryptedMessage::new(0x7777, vec![1, 2, 3]);
    let packet = codec::seal(&cipher, Direction::ClientToHost, 4, &message).unwrap();
    let opened = codec::open(&cipher, Direction::ClientToHost, &packet).unwrap();
    assert_eq!(opened, message);
    assert_eq!(
        messages::decode_message(&opened),
        Err(DecodeError::UnknownType(0x7777))
    );
    assert_eq!(MessageKind::from_u16(0x7777), None);
}
