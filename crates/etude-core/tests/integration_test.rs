use etude_core::metrics::Diagnostics;
use etude_core::{Crc32, Dispatcher, EngineConfig, PKG_HEADER_LEN, PacketHeader, Session, SocketEngine};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

const PING: [u8; 8] = [0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

fn ping(session: &Session<'_>, _: &PacketHeader, body: &[u8]) -> bool {
    session.touch_heartbeat();
    body.is_empty() && session.reply(0, &[]).is_ok()
}

fn echo(session: &Session<'_>, header: &PacketHeader, body: &[u8]) -> bool {
    session.reply(header.message_code, body).is_ok()
}

fn base_config() -> EngineConfig {
    EngineConfig {
        listen_host: "127.0.0.1".to_string(),
        listen_ports: vec![0],
        worker_connections: 16,
        admission_free_floor: 16,
        worker_threads: 2,
        flood_enabled: false,
        poll_timeout: Duration::from_millis(10),
        diagnostics_interval: None,
        ..EngineConfig::default()
    }
}

fn start(config: EngineConfig) -> (SocketEngine, u16) {
    let dispatcher = Dispatcher::builder().route(0, ping).route(5, echo).build();
    let mut engine = SocketEngine::new(config, dispatcher);
    engine.initialize().unwrap();
    engine.initialize_subprocess().unwrap();
    let port = engine.local_ports()[0];
    (engine, port)
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

/// Drive the event loop until `cond` holds on the diagnostics snapshot.
fn pump_until(engine: &mut SocketEngine, what: &str, cond: impl Fn(&Diagnostics) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        engine.process_events_and_timers().unwrap();
        if cond(&engine.diagnostics().unwrap()) {
            return;
        }
    }
    panic!("timed out waiting for {}: {:?}", what, engine.diagnostics());
}

fn pump_for(engine: &mut SocketEngine, dur: Duration) {
    let deadline = Instant::now() + dur;
    while Instant::now() < deadline {
        engine.process_events_and_timers().unwrap();
    }
}

fn read_packet(stream: &mut TcpStream) -> (PacketHeader, Vec<u8>) {
    let mut head = [0u8; PKG_HEADER_LEN];
    stream.read_exact(&mut head).unwrap();
    let header = PacketHeader::decode(&head).unwrap();
    let mut body = vec![0u8; header.body_len()];
    stream.read_exact(&mut body).unwrap();
    (header, body)
}

fn assert_closed_by_server(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => return,
            Err(e) => panic!("expected the server to close the connection: {}", e),
        }
    }
}

#[test]
fn header_split_across_reads_dispatches_once() {
    let (mut engine, port) = start(base_config());
    let mut client = connect(port);
    pump_until(&mut engine, "accept", |d| d.counters.online == 1);

    client.write_all(&PING[..3]).unwrap();
    pump_for(&mut engine, Duration::from_millis(50));
    assert_eq!(engine.diagnostics().unwrap().counters.frames_received, 0);

    client.write_all(&PING[3..]).unwrap();
    pump_until(&mut engine, "frame", |d| d.counters.frames_received == 1);

    let (header, body) = read_packet(&mut client);
    assert_eq!(header.total_length as usize, PKG_HEADER_LEN);
    assert_eq!(header.message_code, 0);
    assert!(body.is_empty());

    // exactly one reply
    client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut extra = [0u8; 1];
    let err = client.read(&mut extra).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));
}

#[test]
fn body_frames_round_trip_through_a_handler() {
    let (mut engine, port) = start(base_config());
    let mut client = connect(port);

    let body: Vec<u8> = (0..100u8).collect();
    let header = PacketHeader::for_body(5, &body, &Crc32).unwrap();
    client.write_all(&header.to_bytes()).unwrap();
    // body dribbles in over several reads
    for chunk in body.chunks(30) {
        client.write_all(chunk).unwrap();
        pump_for(&mut engine, Duration::from_millis(20));
    }
    pump_until(&mut engine, "frame", |d| d.counters.frames_received == 1);

    let (reply, reply_body) = read_packet(&mut client);
    assert_eq!(reply, header);
    assert_eq!(reply_body, body);
}

#[test]
fn short_length_is_discarded_and_connection_stays_open() {
    let (mut engine, port) = start(base_config());
    let mut client = connect(port);

    client.write_all(&[0x00, 0x02, 0, 0, 0, 0, 0, 0]).unwrap();
    pump_until(&mut engine, "malformed frame", |d| d.counters.malformed_frames == 1);
    assert_eq!(engine.diagnostics().unwrap().counters.online, 1);

    client.write_all(&PING).unwrap();
    pump_until(&mut engine, "ping", |d| d.counters.frames_received == 1);
    let (header, _) = read_packet(&mut client);
    assert_eq!(header.message_code, 0);
}

#[test]
fn oversized_length_is_discarded_and_connection_stays_open() {
    let (mut engine, port) = start(base_config());
    let mut client = connect(port);

    let len = 65_000u16.to_be_bytes();
    client.write_all(&[len[0], len[1], 0, 5, 0, 0, 0, 0]).unwrap();
    pump_until(&mut engine, "malformed frame", |d| d.counters.malformed_frames == 1);

    client.write_all(&PING).unwrap();
    pump_until(&mut engine, "ping", |d| d.counters.frames_received == 1);
    let (header, _) = read_packet(&mut client);
    assert_eq!(header.message_code, 0);
    assert_eq!(engine.diagnostics().unwrap().counters.online, 1);
}

#[test]
fn bad_checksum_gets_no_reply() {
    let (mut engine, port) = start(base_config());
    let mut client = connect(port);

    let mut packet = PacketHeader::for_body(5, b"hello", &Crc32).unwrap().to_bytes().to_vec();
    packet.extend_from_slice(b"HELLO");
    client.write_all(&packet).unwrap();
    client.write_all(&PING).unwrap();
    pump_until(&mut engine, "frames", |d| d.counters.frames_received == 2);

    // the only reply is the ping
    let (header, body) = read_packet(&mut client);
    assert_eq!(header.message_code, 0);
    assert!(body.is_empty());
}

#[test]
fn peer_close_parks_the_slot_for_recycling() {
    let (mut engine, port) = start(base_config());
    let client = connect(port);
    pump_until(&mut engine, "accept", |d| d.counters.online == 1);

    drop(client);
    pump_until(&mut engine, "close", |d| d.counters.online == 0);
    let pool = engine.diagnostics().unwrap().pool;
    assert_eq!(pool.pending, 1);
    assert_eq!(pool.active, 1); // the listener
    assert_eq!(pool.free + pool.active + pool.pending, pool.total);
}

#[test]
fn clients_beyond_worker_connections_are_rejected() {
    let config = EngineConfig {
        worker_connections: 1,
        admission_free_floor: 1,
        ..base_config()
    };
    let (mut engine, port) = start(config);

    let _first = connect(port);
    pump_until(&mut engine, "first accept", |d| d.counters.online == 1);

    let mut second = connect(port);
    pump_until(&mut engine, "rejection", |d| d.counters.rejected == 1);
    assert_closed_by_server(&mut second);
    assert_eq!(engine.diagnostics().unwrap().counters.online, 1);
}

#[test]
fn flooding_peer_is_kicked() {
    let config = EngineConfig {
        flood_enabled: true,
        flood_interval: Duration::from_secs(10),
        flood_kick_count: 3,
        ..base_config()
    };
    let (mut engine, port) = start(config);
    let mut client = connect(port);

    let burst: Vec<u8> = PING.iter().copied().cycle().take(PING.len() * 4).collect();
    client.write_all(&burst).unwrap();
    pump_until(&mut engine, "flood kick", |d| d.counters.flood_kicks == 1);
    assert_eq!(engine.diagnostics().unwrap().counters.online, 0);
    assert_closed_by_server(&mut client);
}

#[test]
fn silent_peer_is_kicked_in_timeout_kick_mode() {
    let config = EngineConfig {
        heartbeat_enabled: true,
        heartbeat_wait: Duration::from_millis(300),
        timeout_kick: true,
        ..base_config()
    };
    let (mut engine, port) = start(config);
    let mut client = connect(port);
    pump_until(&mut engine, "accept", |d| d.heartbeat_entries == 1);

    pump_until(&mut engine, "heartbeat kick", |d| d.counters.heartbeat_kicks == 1);
    assert_eq!(engine.diagnostics().unwrap().heartbeat_entries, 0);
    assert_closed_by_server(&mut client);
}

#[test]
fn quiet_peer_survives_within_the_grace_window() {
    let config = EngineConfig {
        heartbeat_enabled: true,
        heartbeat_wait: Duration::from_millis(300),
        heartbeat_grace: Duration::from_secs(30),
        ..base_config()
    };
    let (mut engine, port) = start(config);
    let _client = connect(port);
    pump_until(&mut engine, "accept", |d| d.counters.online == 1);

    pump_for(&mut engine, Duration::from_millis(1200));
    let d = engine.diagnostics().unwrap();
    assert_eq!(d.counters.heartbeat_kicks, 0);
    assert_eq!(d.counters.online, 1);
    // sliding mode keeps the entry enrolled
    assert_eq!(d.heartbeat_entries, 1);
}

#[test]
fn shutdown_closes_open_connections() {
    let (mut engine, port) = start(base_config());
    let mut client = connect(port);
    client.write_all(&PING).unwrap();
    client.write_all(&[0x00, 0x40, 0, 5, 0, 0, 0, 0, 1, 2, 3]).unwrap();
    pump_until(&mut engine, "ping", |d| d.counters.frames_received == 1);
    read_packet(&mut client);

    engine.shutdown_subprocess();
    assert!(engine.diagnostics().is_none());
    assert_closed_by_server(&mut client);
}

fn shrink_receive_buffer(stream: &TcpStream, bytes: libc::c_int) {
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &bytes as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
}

#[test]
fn stalled_reader_gets_every_reply_in_order() {
    const REQUESTS: usize = 2000;
    const BODY: usize = 4000;

    let config = EngineConfig {
        worker_threads: 1,
        max_send_queue: 100_000,
        max_conn_send_queue: 100_000,
        ..base_config()
    };
    let (mut engine, port) = start(config);

    let mut stream = connect(port);
    shrink_receive_buffer(&stream, 4096);
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let mut expected = Vec::with_capacity(REQUESTS * (PKG_HEADER_LEN + BODY));
    for seq in 0..REQUESTS as u32 {
        let mut body = vec![(seq % 251) as u8; BODY];
        body[..4].copy_from_slice(&seq.to_be_bytes());
        expected.extend_from_slice(&PacketHeader::for_body(5, &body, &Crc32).unwrap().to_bytes());
        expected.extend_from_slice(&body);
    }

    let request = expected.clone();
    let client = thread::spawn(move || {
        stream.write_all(&request).unwrap();
        // replies pile up past the socket buffers and have to be parked
        thread::sleep(Duration::from_millis(800));
        let mut received = vec![0u8; request.len()];
        stream.read_exact(&mut received).unwrap();
        (stream, received)
    });

    let deadline = Instant::now() + Duration::from_secs(60);
    while !client.is_finished() {
        assert!(Instant::now() < deadline, "client never received all replies");
        engine.process_events_and_timers().unwrap();
    }
    let (mut stream, received) = client.join().unwrap();
    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "replies arrived corrupted or out of order");

    // nothing else is owed
    stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut extra = [0u8; 1];
    let err = stream.read(&mut extra).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

    pump_until(&mut engine, "buffers released", |d| {
        d.live_buffers == 0 && d.send_queue_depth == 0 && d.counters.frames_received == REQUESTS
    });
    let d = engine.diagnostics().unwrap();
    assert_eq!(d.counters.bytes_sent, expected.len());
    assert_eq!(d.counters.sends_discarded, 0);

    engine.shutdown_subprocess();
    assert_closed_by_server(&mut stream);
}
