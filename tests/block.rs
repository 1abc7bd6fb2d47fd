mod common;

use common::{SimCard, SimKind, XorShift};
use embedded_io::SeekFrom;
use embedded_io::blocking::{Read, Seek, Write};
use rp_sdspi::{IoError, SdSpi, SharedCard};

fn ready_card(sim: SimCard) -> SdSpi<SimCard> {
    let mut card = SdSpi::new(sim);
    card.initialize().unwrap();
    card
}

#[test]
fn blocks_round_trip() {
    let mut card = ready_card(SimCard::new(SimKind::Sdhc));
    let mut rng = XorShift(0x2545_F491);

    for _ in 0..64 {
        let address = rng.next() % 4096;
        let data = rng.block();

        card.write_block(address, &data).unwrap();
        assert_eq!(card.bus().block(address), data);
        assert_eq!(card.read_block(address).unwrap(), data);
    }

    assert!(!card.bus().selected);
}

#[test]
fn read_into_existing_buffer() {
    let mut sim = SimCard::new(SimKind::V2);
    sim.blocks.insert(7, [0x5A; 512]);
    let mut card = ready_card(sim);

    let mut block = [0u8; 512];
    card.read_block_into(7, &mut block).unwrap();

    assert_eq!(block, [0x5A; 512]);
    assert_eq!(card.bus().commands.last(), Some(&(17, 7)));
}

#[test]
fn idle_card_rejects_reads() {
    let mut card = SdSpi::new(SimCard::new(SimKind::V2));

    let err = card.read_block(0).unwrap_err();

    assert_eq!(
        err,
        IoError::CommandRejected {
            command: 17,
            status: 0x01
        }
    );
}

#[test]
fn missing_token_times_out() {
    let mut sim = SimCard::new(SimKind::V2);
    sim.withhold_token = true;
    let mut card = ready_card(sim);

    let err = card.read_block(3).unwrap_err();

    assert_eq!(err, IoError::TokenTimeout { polls: 1000 });
    assert!(!card.bus().selected);
}

#[test]
fn rejected_write() {
    let mut sim = SimCard::new(SimKind::V2);
    sim.reject_write_at = Some(9);
    let mut card = ready_card(sim);

    let err = card.write_block(9, &[1; 512]).unwrap_err();

    assert_eq!(err, IoError::WriteRejected { response: 0x0B });
    assert!(!card.bus().blocks.contains_key(&9));
    assert!(!card.bus().selected);

    // The card carries on afterwards
    card.write_block(10, &[2; 512]).unwrap();
    assert_eq!(card.read_block(10).unwrap(), [2; 512]);
}

#[test]
fn card_stuck_busy() {
    let mut sim = SimCard::new(SimKind::V2);
    sim.write_busy = 5000;
    let mut card = ready_card(sim);

    let err = card.write_block(0, &[0xEE; 512]).unwrap_err();

    assert_eq!(err, IoError::BusyTimeout { polls: 1000 });
    assert!(!card.bus().selected);
}

#[test]
fn cursor_spans_blocks() {
    let mut card = ready_card(SimCard::new(SimKind::Sdhc));
    let payload: Vec<u8> = (1..=24).collect();

    {
        let mut cursor = card.cursor();
        assert_eq!(cursor.seek(SeekFrom::Start(500)).unwrap(), 500);
        cursor.write_all(&payload).unwrap();
        assert_eq!(cursor.position(), 524);
        cursor.flush().unwrap();
    }

    let sim = card.bus();
    assert_eq!(&sim.block(0)[500..], &payload[..12]);
    assert_eq!(&sim.block(1)[..12], &payload[12..]);
    assert!(sim.block(1)[12..].iter().all(|b| *b == 0));

    let mut cursor = card.cursor();
    cursor.seek(SeekFrom::Start(524)).unwrap();
    cursor.seek(SeekFrom::Current(-24)).unwrap();

    let mut back = [0u8; 24];
    cursor.read_exact(&mut back).unwrap();
    assert_eq!(&back[..], &payload[..]);
}

#[test]
fn cursor_reads_stop_at_block_end() {
    let mut sim = SimCard::new(SimKind::Sdhc);
    sim.blocks.insert(0, [0x11; 512]);
    let mut card = ready_card(sim);
    let mut cursor = card.cursor();

    cursor.seek(SeekFrom::Start(508)).unwrap();
    let mut buffer = [0u8; 16];

    assert_eq!(cursor.read(&mut buffer).unwrap(), 4);
    assert_eq!(&buffer[..4], [0x11; 4]);
    assert_eq!(cursor.position(), 512);
}

#[test]
fn cursor_needs_card_size_to_seek_from_end() {
    let mut card = ready_card(SimCard::new(SimKind::Sdhc));
    let mut cursor = card.cursor();

    assert_eq!(
        cursor.seek(SeekFrom::End(-1)).unwrap_err(),
        IoError::SizeUnknown {}
    );
    assert_eq!(
        cursor.seek(SeekFrom::Current(-1)).unwrap_err(),
        IoError::UnexpectedEof {}
    );
    assert_eq!(cursor.position(), 0);
}

#[test]
fn cursor_seeks_from_end_once_size_is_known() {
    let mut sim = SimCard::new(SimKind::Sdhc);
    sim.csd[0] = 0x40;
    // c_size 0, 1024 blocks
    let mut card = ready_card(sim);
    card.read_csd().unwrap();

    let mut cursor = card.cursor();
    assert_eq!(cursor.seek(SeekFrom::End(-512)).unwrap(), 1023 * 512);
}

#[test]
fn cursor_refuses_blocks_past_32_bits() {
    let mut card = ready_card(SimCard::new(SimKind::Sdhc));
    let position = (1u64 << 32) * 512;

    {
        let mut cursor = card.cursor();
        cursor.seek(SeekFrom::Start(position)).unwrap();

        assert_eq!(
            cursor.write(&[0xAB; 4]).unwrap_err(),
            IoError::PastEnd { position }
        );
        assert_eq!(
            cursor.read(&mut [0u8; 4]).unwrap_err(),
            IoError::PastEnd { position }
        );
        cursor.flush().unwrap();
    }

    let sim = card.bus();
    assert!(sim.blocks.is_empty());
    assert!(!sim.command_indices().contains(&24));
}

#[test]
fn cursor_stops_at_card_end() {
    let mut sim = SimCard::new(SimKind::Sdhc);
    sim.csd[0] = 0x40;
    // c_size 0, 1024 blocks
    let mut card = ready_card(sim);
    card.read_csd().unwrap();
    let end = 1024 * 512;

    {
        let mut cursor = card.cursor();

        cursor.seek(SeekFrom::End(-2)).unwrap();
        let mut tail = [0u8; 8];
        assert_eq!(cursor.read(&mut tail).unwrap(), 2);
        assert_eq!(cursor.position(), end);
        assert_eq!(cursor.read(&mut tail).unwrap(), 0);

        assert_eq!(
            cursor.write(&[0xAB; 4]).unwrap_err(),
            IoError::PastEnd { position: end }
        );
    }

    assert!(card.bus().blocks.is_empty());
}

#[test]
fn shared_card() {
    let shared = SharedCard::new(SdSpi::new(SimCard::new(SimKind::V2)));

    shared.with(|card| card.initialize()).unwrap();
    shared
        .with(|card| card.write_block(4, &[0x42; 512]))
        .unwrap();

    let block = shared.with(|card| card.read_block(4)).unwrap();
    assert_eq!(block, [0x42; 512]);

    let card = shared.into_inner();
    assert!(card.is_ready());
}
