use respio::command;
use respio::resp::{decode_frame, ProtocolError};

#[test]
fn pipelined_commands_decode_one_frame_at_a_time() {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
    buf.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n");
    buf.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");

    let mut cursor = 0;
    let mut frames = Vec::new();
    while let Some((consumed, args)) = decode_frame(&buf[cursor..]).unwrap() {
        frames.push(args);
        cursor += consumed;
    }
    assert_eq!(cursor, buf.len());

    let cmds: Vec<_> = frames.iter().map(|f| command::parse(f).unwrap()).collect();
    assert!(matches!(cmds[0], command::Command::Ping));
    assert!(matches!(cmds[1], command::Command::Set { .. }));
    assert!(matches!(cmds[2], command::Command::Get(_)));
}

#[test]
fn malformed_header_is_a_protocol_error_not_a_command_error() {
    assert_eq!(decode_frame(b"$3\r\nfoo\r\n"), Err(ProtocolError::ExpectedArray));
}

#[test]
fn a_syntactically_bad_command_in_a_well_formed_frame_is_a_command_error() {
    let (_, args) = decode_frame(b"*1\r\n$3\r\nGET\r\n").unwrap().unwrap();
    assert_eq!(command::parse(&args), Err(command::CommandError::WrongArity("GET".into())));
}
