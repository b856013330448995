use satchain::codec::*;
use satchain::protocol::*;
use satchain::*;

fn id(s: &str) -> SatelliteId {
    s.parse().unwrap()
}

fn round_trip(msg: &Message) -> Message {
    let protocol = Protocol::standard();
    let frame = encode_frame(msg, &protocol).unwrap();
    decode_frame(&frame, &protocol).unwrap()
}

#[test]
fn test_crc8_check_value() {
    // CRC-8/SMBUS catalogue check value
    assert_eq!(checksum(b"123456789"), 0xF4);
}

#[test]
fn test_known_wire_vectors() {
    let protocol = Protocol::standard();

    let status = Message::new(id("0101"), Command::Status, Payload::Bytes(vec![100, 200, 50]));
    assert_eq!(
        encode_frame(&status, &protocol).unwrap(),
        vec![0x08, 0x01, 0x01, 0x06, 0x64, 0xC8, 0x32, 0x8A, 0x00]
    );

    let assign = Message::new(Destination::All, Command::IdAssign, Payload::text("0100"));
    assert_eq!(
        encode_frame(&assign, &protocol).unwrap(),
        vec![0x08, 0xFF, 0x04, 0x30, 0x31, 0x30, 0x30, 0x6A, 0x00]
    );

    let new_sat = Message::new(Destination::Satellites, Command::NewSat, Payload::text("01"));
    assert_eq!(
        encode_frame(&new_sat, &protocol).unwrap(),
        vec![0x06, 0xFE, 0x05, 0x30, 0x31, 0x69, 0x00]
    );
}

#[test]
fn test_round_trip_every_schema() {
    let messages = vec![
        Message::new(id("0100"), Command::Hello, Payload::text("INDUSTRIAL")),
        Message::new(Destination::All, Command::IdAssign, Payload::text("0100")),
        Message::new(id("0102"), Command::Mode, Payload::text("ACTIVE")),
        Message::new(id("0102"), Command::Dsp, Payload::text("HELLO WORLD")),
        Message::new(id("0102"), Command::Error, Payload::text("LOGIC_BROWNOUT:4.5V")),
        Message::new(id("0101"), Command::Status, Payload::Bytes(vec![1, 2, 3, 255])),
        Message::new(id("0101"), Command::LedRainbow, Payload::Bytes(vec![0, 128, 255])),
        Message::new(id("0101"), Command::DspMatrix, Payload::Bytes(vec![9; 64])),
        Message::new(id("0102"), Command::Power, Payload::Floats(vec![19.5, 18.2, 5.0])),
        Message::new(Destination::All, Command::SyncFrame, Payload::Floats(vec![1024.0, 33.25])),
        Message::new(id("0101"), Command::SetEnc, Payload::Words(vec![0, 1000, 65535])),
        Message::new(id("0101"), Command::Ping, Payload::empty()),
    ];

    for msg in &messages {
        assert_eq!(&round_trip(msg), msg, "{}", msg);
    }
}

#[test]
fn test_leading_zeros_preserved() {
    let msg = Message::new(Destination::Satellites, Command::NewSat, Payload::text("01"));
    let decoded = round_trip(&msg);
    assert_eq!(decoded.payload(), &Payload::Text("01".to_string()));

    let msg = Message::new(id("0100"), Command::Log, Payload::text("007"));
    assert_eq!(round_trip(&msg).payload().as_text(), Some("007"));
}

#[test]
fn test_single_bit_flips_rejected() {
    let protocol = Protocol::standard();
    let messages = vec![
        Message::new(id("0101"), Command::Status, Payload::Bytes(vec![100, 200, 50])),
        Message::new(Destination::All, Command::IdAssign, Payload::text("0100")),
        Message::new(id("0101"), Command::Led, Payload::Bytes(vec![0, 0, 0, 0])),
        Message::new(Destination::Satellites, Command::NewSat, Payload::text("01")),
        Message::new(id("0102"), Command::Ping, Payload::empty()),
        Message::new(id("0100"), Command::Hello, Payload::text("INDUSTRIAL")),
    ];

    for msg in &messages {
        let frame = encode_frame(msg, &protocol).unwrap();
        // every byte except the terminator
        for byte in 0..frame.len() - 1 {
            for bit in 0..8 {
                let mut damaged = frame.clone();
                damaged[byte] ^= 1 << bit;
                assert!(
                    decode_frame(&damaged, &protocol).is_err(),
                    "{} survived flip of bit {} in byte {}",
                    msg,
                    bit,
                    byte
                );
            }
        }
    }
}

#[test]
fn test_code_byte_flip_can_pass_checksum() {
    let protocol = Protocol::standard();
    let power = Message::new(id("0102"), Command::Power, Payload::Floats(vec![19.5, 18.2, 5.0]));
    let frame = encode_frame(&power, &protocol).unwrap();
    assert_eq!(frame[0], 0x04);

    // 0x04 -> 0x0C moves the first restored zero, and the checksum happens to agree
    let mut damaged = frame.clone();
    damaged[0] ^= 1 << 3;
    let decoded = decode_frame(&damaged, &protocol).unwrap();

    assert_ne!(decoded, power);
    assert_eq!(decoded.destination(), Destination::Node(id("0102")));
    assert_eq!(
        decoded.payload(),
        &Payload::Floats(vec![f32::from_le_bytes([0x01, 0x07, 0x9C, 0x41]), 18.2, 5.0])
    );
}

#[test]
fn test_three_digit_index_rejected_on_the_wire() {
    let protocol = Protocol::standard();
    let raw = [0x01, 100, 0x01];
    let mut pre = raw.to_vec();
    pre.push(checksum(&raw));
    assert_eq!(decode_frame(&stuff(&pre), &protocol), Err(FrameError::UnknownDestination(0x01)));
}

#[test]
fn test_checksum_error_reported() {
    let protocol = Protocol::standard();
    // valid stuffing, wrong checksum byte
    let frame = stuff(&[0x01, 0x01, 0x06, 0x64, 0xC8, 0x32, 0x8B]);
    assert_eq!(
        decode_frame(&frame, &protocol),
        Err(FrameError::Checksum { expected: 0x8A, actual: 0x8B })
    );
}

#[test]
fn test_stuffing_never_emits_terminator() {
    let protocol = Protocol::standard();
    let payloads = vec![
        vec![0u8; 4],
        vec![0u8; 200],
        vec![0u8; MAX_PAYLOAD_SIZE],
        (0..=255u8).collect::<Vec<_>>(),
        vec![255u8; 254],
        vec![1u8; 253],
    ];

    for bytes in payloads {
        let msg = Message::new(id("0101"), Command::DspMatrix, Payload::Bytes(bytes));
        let frame = encode_frame(&msg, &protocol).unwrap();
        let (last, body) = frame.split_last().unwrap();
        assert_eq!(*last, FRAME_TERMINATOR);
        assert!(!body.contains(&FRAME_TERMINATOR));
        assert!(frame.len() <= MAX_FRAME_SIZE);
        assert_eq!(decode_frame(&frame, &protocol).unwrap(), msg);
    }
}

#[test]
fn test_unscheduled_command_passes_raw_bytes() {
    let protocol = Protocol::standard();
    let msg = Message::new(id("0101"), Command::Ack, Payload::Raw(vec![0, 1, 2, 0, 250]));
    assert_eq!(round_trip(&msg), msg);

    // a frame with a command code this node does not know still decodes
    let raw = [0x01, 0x01, 0x7E, 0xAB, 0x00, 0xCD];
    let mut pre = raw.to_vec();
    pre.push(checksum(&raw));
    let decoded = decode_frame(&stuff(&pre), &protocol).unwrap();
    assert_eq!(decoded.command(), Command::Unknown(0x7E));
    assert_eq!(decoded.payload(), &Payload::Raw(vec![0xAB, 0x00, 0xCD]));
}

#[test]
fn test_comma_separated_text_coerced() {
    let protocol = Protocol::standard();

    let led = Message::new(id("0101"), Command::Led, Payload::text("255, 0,128"));
    let decoded = decode_frame(&encode_frame(&led, &protocol).unwrap(), &protocol).unwrap();
    assert_eq!(decoded.payload(), &Payload::Bytes(vec![255, 0, 128]));

    let power = Message::new(id("0101"), Command::Power, Payload::text("19.5,18.25,5"));
    let decoded = decode_frame(&encode_frame(&power, &protocol).unwrap(), &protocol).unwrap();
    assert_eq!(decoded.payload(), &Payload::Floats(vec![19.5, 18.25, 5.0]));

    // bytes widen to words
    let enc = Message::new(id("0101"), Command::SetEnc, Payload::Bytes(vec![1, 2]));
    let decoded = decode_frame(&encode_frame(&enc, &protocol).unwrap(), &protocol).unwrap();
    assert_eq!(decoded.payload(), &Payload::Words(vec![1, 2]));

    // schemaless text of small integers goes out as bytes
    let ping = Message::new(id("0101"), Command::Ping, Payload::text("1,2,3"));
    let decoded = decode_frame(&encode_frame(&ping, &protocol).unwrap(), &protocol).unwrap();
    assert_eq!(decoded.payload(), &Payload::Raw(vec![1, 2, 3]));
}

#[test]
fn test_encoding_errors() {
    let protocol = Protocol::standard();

    let lossy = Message::new(id("0101"), Command::Led, Payload::Words(vec![300]));
    assert!(matches!(
        encode_frame(&lossy, &protocol),
        Err(ProtocolError::PayloadMismatch { command: Command::Led, .. })
    ));

    let fraction = Message::new(id("0101"), Command::Led, Payload::text("1.5"));
    assert!(matches!(encode_frame(&fraction, &protocol), Err(ProtocolError::PayloadMismatch { .. })));

    let short = Message::new(id("0101"), Command::Power, Payload::Floats(vec![19.5, 18.2]));
    assert_eq!(
        encode_frame(&short, &protocol),
        Err(ProtocolError::FieldCount { command: Command::Power, expected: 3, actual: 2 })
    );

    let text_as_floats = Message::new(id("0101"), Command::Hello, Payload::Floats(vec![1.0]));
    assert!(matches!(encode_frame(&text_as_floats, &protocol), Err(ProtocolError::PayloadMismatch { .. })));

    let unknown = Message::new(id("0101"), Command::Unknown(0x7E), Payload::empty());
    assert!(matches!(encode_frame(&unknown, &protocol), Err(ProtocolError::UnknownCommand(_))));

    let too_big = Message::new(id("0101"), Command::DspMatrix, Payload::Bytes(vec![1; MAX_PAYLOAD_SIZE + 1]));
    assert_eq!(
        encode_frame(&too_big, &protocol),
        Err(ProtocolError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
    );
}

#[test]
fn test_malformed_frames_rejected() {
    let protocol = Protocol::standard();

    assert_eq!(decode_frame(&[], &protocol), Err(FrameError::Truncated(0)));
    assert_eq!(decode_frame(&[0x00], &protocol), Err(FrameError::Truncated(0)));
    // embedded terminator
    assert_eq!(decode_frame(&[0x03, 0x00, 0x01, 0x00], &protocol), Err(FrameError::Stuffing));
    // code byte points past the end
    assert_eq!(decode_frame(&[0x09, 0x01, 0x02, 0x00], &protocol), Err(FrameError::Stuffing));

    // too short once unstuffed
    let mut pre = vec![0xFF];
    pre.push(checksum(&pre));
    assert!(matches!(decode_frame(&stuff(&pre), &protocol), Err(FrameError::Truncated(2))));

    // reserved-looking code that is not in the destination table
    let body = [0xC0, 0x01];
    let mut pre = body.to_vec();
    pre.push(checksum(&body));
    assert_eq!(decode_frame(&stuff(&pre), &protocol), Err(FrameError::UnknownDestination(0xC0)));

    // odd length for a words payload
    let body = [0x01, 0x01, 0x30, 0x01, 0x02, 0x03];
    let mut pre = body.to_vec();
    pre.push(checksum(&body));
    assert!(matches!(
        decode_frame(&stuff(&pre), &protocol),
        Err(FrameError::InvalidPayload { command: Command::SetEnc, .. })
    ));
}

#[test]
fn test_accumulator_reassembles_split_stream() {
    let protocol = Protocol::standard();
    let a = encode_frame(&Message::new(id("0101"), Command::Ping, Payload::empty()), &protocol).unwrap();
    let b = encode_frame(&Message::new(id("0102"), Command::Log, Payload::text("hi")), &protocol).unwrap();

    let mut stream = a.clone();
    stream.extend_from_slice(&b);

    let mut acc = FrameAccumulator::default();
    let mut frames = std::collections::VecDeque::new();
    for chunk in stream.chunks(3) {
        acc.feed(chunk, &mut frames);
    }

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], a);
    assert_eq!(frames[1], b);
    assert_eq!(acc.pending(), 0);
}

#[test]
fn test_custom_protocol_tables() {
    let commands = [
        CommandSpec { command: Command::Ping, code: 0x01, schema: None },
        CommandSpec {
            command: Command::Log,
            code: 0x40,
            schema: Some(PayloadSchema::variable(Encoding::Text)),
        },
    ];
    let protocol = Protocol::new(&commands, STANDARD_DESTINATIONS).unwrap();

    let msg = Message::new(id("0101"), Command::Log, Payload::text("custom"));
    let frame = encode_frame(&msg, &protocol).unwrap();
    assert_eq!(decode_frame(&frame, &protocol).unwrap(), msg);

    // the standard table reads code 0x40 as unknown
    let standard = Protocol::standard();
    assert_eq!(decode_frame(&frame, &standard).unwrap().command(), Command::Unknown(0x40));

    let clash = [
        CommandSpec { command: Command::Ping, code: 0x01, schema: None },
        CommandSpec { command: Command::Ping, code: 0x02, schema: None },
    ];
    assert!(Protocol::new(&clash, STANDARD_DESTINATIONS).is_err());
}
