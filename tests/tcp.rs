use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use exio::net::{TcpListener, TcpStream};
use exio::{async_accept, async_recv_some, async_send_some};
use exio::{Context, Error, OperationState, Receiver, Sender, StopSource};

mod util;

use util::{init, Outcome, Signal, TestReceiver};

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn accept_and_echo_roundtrip() {
    init();

    let context = Context::new().expect("unable to create context");
    let listener = TcpListener::bind(any_addr()).expect("unable to bind listener");
    let addr = listener.local_addr().expect("unable to get local addr");

    thread::scope(|scope| {
        let handle = scope.spawn(|| context.run());

        let peer = scope.spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).expect("unable to connect");
            stream.write_all(b"hello").expect("unable to write");

            let mut echoed = [0u8; 5];
            stream.read_exact(&mut echoed).expect("unable to read echo");
            assert_eq!(&echoed, b"hello");
        });

        // Accept the peer's connection.
        let accept_signal = Signal::new();
        let mut accept = pin!(async_accept(context.scheduler(), &listener)
            .connect(TestReceiver::new(&accept_signal)));
        accept.as_mut().start();
        let stream: TcpStream = match accept_signal.wait() {
            Outcome::Value(stream) => stream,
            outcome => panic!("accept did not produce a socket: {:?}", outcome),
        };

        // Read whatever the peer sent. The operation borrows the buffer, so
        // it lives in its own scope.
        let mut buf = [0u8; 32];
        let n = {
            let recv_signal = Signal::new();
            let mut recv = pin!(async_recv_some(context.scheduler(), &stream, &mut buf[..])
                .connect(TestReceiver::new(&recv_signal)));
            recv.as_mut().start();
            match recv_signal.wait() {
                Outcome::Value(n) => n,
                outcome => panic!("recv failed: {:?}", outcome),
            }
        };
        assert_eq!(&buf[..n], b"hello");

        // Echo it back.
        let send_signal = Signal::new();
        let mut send = pin!(async_send_some(context.scheduler(), &stream, &buf[..n])
            .connect(TestReceiver::new(&send_signal)));
        send.as_mut().start();
        assert_eq!(send_signal.wait(), Outcome::Value(5));

        peer.join().unwrap();
        context.request_stop();
        handle.join().unwrap().expect("run failed");
    });
}

#[test]
fn recv_on_closed_stream_is_eof() {
    init();

    let context = Context::new().expect("unable to create context");
    let listener = TcpListener::bind(any_addr()).expect("unable to bind listener");
    let addr = listener.local_addr().expect("unable to get local addr");

    thread::scope(|scope| {
        let handle = scope.spawn(|| context.run());

        let peer = scope.spawn(move || {
            let stream = std::net::TcpStream::connect(addr).expect("unable to connect");
            drop(stream);
        });

        let accept_signal = Signal::new();
        let mut accept = pin!(async_accept(context.scheduler(), &listener)
            .connect(TestReceiver::new(&accept_signal)));
        accept.as_mut().start();
        let stream: TcpStream = match accept_signal.wait() {
            Outcome::Value(stream) => stream,
            outcome => panic!("accept did not produce a socket: {:?}", outcome),
        };
        peer.join().unwrap();

        let mut buf = [0u8; 16];
        let recv_signal = Signal::new();
        let mut recv = pin!(async_recv_some(context.scheduler(), &stream, &mut buf[..])
            .connect(TestReceiver::new(&recv_signal)));
        recv.as_mut().start();
        assert_eq!(recv_signal.wait(), Outcome::Error(Error::Eof));

        context.request_stop();
        handle.join().unwrap().expect("run failed");
    });
}

// The eager first attempt: with a connection already pending, accept
// completes on the spot instead of arming the multiplexer.
#[test]
fn accept_with_pending_connection_is_immediate() {
    init();

    let context = Context::new().expect("unable to create context");
    let listener = TcpListener::bind(any_addr()).expect("unable to bind listener");
    let addr = listener.local_addr().expect("unable to get local addr");

    thread::scope(|scope| {
        let handle = scope.spawn(|| context.run());

        // Connect first, then start the accept.
        let _peer = std::net::TcpStream::connect(addr).expect("unable to connect");
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        let accept_signal: Signal<TcpStream> = Signal::new();
        let mut accept = pin!(async_accept(context.scheduler(), &listener)
            .connect(TestReceiver::new(&accept_signal)));
        accept.as_mut().start();

        match accept_signal.wait() {
            Outcome::Value(_) => {}
            outcome => panic!("accept did not produce a socket: {:?}", outcome),
        }
        assert!(start.elapsed() < Duration::from_millis(100));

        context.request_stop();
        handle.join().unwrap().expect("run failed");
    });
}

#[test]
fn cancel_armed_recv_delivers_stopped() {
    init();

    let context = Context::new().expect("unable to create context");
    let listener = TcpListener::bind(any_addr()).expect("unable to bind listener");
    let addr = listener.local_addr().expect("unable to get local addr");

    thread::scope(|scope| {
        let handle = scope.spawn(|| context.run());

        // Keep the peer open but silent so the recv arms and waits.
        let peer = std::net::TcpStream::connect(addr).expect("unable to connect");

        let accept_signal = Signal::new();
        let mut accept = pin!(async_accept(context.scheduler(), &listener)
            .connect(TestReceiver::new(&accept_signal)));
        accept.as_mut().start();
        let stream: TcpStream = match accept_signal.wait() {
            Outcome::Value(stream) => stream,
            outcome => panic!("accept did not produce a socket: {:?}", outcome),
        };

        let source = StopSource::new();
        let mut buf = [0u8; 16];
        let recv_signal = Signal::new();
        let mut recv = pin!(async_recv_some(context.scheduler(), &stream, &mut buf[..])
            .connect(TestReceiver::with_token(&recv_signal, source.token())));
        recv.as_mut().start();

        thread::sleep(Duration::from_millis(50));
        assert!(!recv_signal.is_completed());
        source.request_stop();

        assert_eq!(recv_signal.wait(), Outcome::Stopped);

        drop(peer);
        context.request_stop();
        handle.join().unwrap().expect("run failed");
    });
}

// One acceptor, several clients: each accept operation takes exactly one
// connection off the backlog.
#[test]
fn sequential_accepts_drain_the_backlog() {
    init();

    let context = Context::new().expect("unable to create context");
    let listener = TcpListener::bind(any_addr()).expect("unable to bind listener");
    let addr = listener.local_addr().expect("unable to get local addr");

    thread::scope(|scope| {
        let handle = scope.spawn(|| context.run());

        let mut peers = Vec::new();
        for i in 0..3u8 {
            let mut stream = std::net::TcpStream::connect(addr).expect("unable to connect");
            stream.write_all(&[i]).expect("unable to write");
            peers.push(stream);
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let accept_signal = Signal::new();
            let mut accept = pin!(async_accept(context.scheduler(), &listener)
                .connect(TestReceiver::new(&accept_signal)));
            accept.as_mut().start();
            let stream: TcpStream = match accept_signal.wait() {
                Outcome::Value(stream) => stream,
                outcome => panic!("accept did not produce a socket: {:?}", outcome),
            };

            let mut buf = [0u8; 1];
            let recv_signal = Signal::new();
            let mut recv = pin!(async_recv_some(context.scheduler(), &stream, &mut buf[..])
                .connect(TestReceiver::new(&recv_signal)));
            recv.as_mut().start();
            assert_eq!(recv_signal.wait(), Outcome::Value(1));
            seen.push(buf[0]);
        }

        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);

        drop(peers);
        context.request_stop();
        handle.join().unwrap().expect("run failed");
    });
}

// "Some" semantics: a small buffer takes only part of what is pending, and
// the rest is picked up by the next operation.
#[test]
fn short_reads_are_normal_outcomes() {
    init();

    let context = Context::new().expect("unable to create context");
    let listener = TcpListener::bind(any_addr()).expect("unable to bind listener");
    let addr = listener.local_addr().expect("unable to get local addr");

    thread::scope(|scope| {
        let handle = scope.spawn(|| context.run());

        let mut peer = std::net::TcpStream::connect(addr).expect("unable to connect");
        peer.write_all(b"abcdefgh").expect("unable to write");

        let accept_signal = Signal::new();
        let mut accept = pin!(async_accept(context.scheduler(), &listener)
            .connect(TestReceiver::new(&accept_signal)));
        accept.as_mut().start();
        let stream: TcpStream = match accept_signal.wait() {
            Outcome::Value(stream) => stream,
            outcome => panic!("accept did not produce a socket: {:?}", outcome),
        };

        let mut collected = Vec::new();
        while collected.len() < 8 {
            let mut buf = [0u8; 3];
            let n = {
                let recv_signal = Signal::new();
                let mut recv = pin!(async_recv_some(context.scheduler(), &stream, &mut buf[..])
                    .connect(TestReceiver::new(&recv_signal)));
                recv.as_mut().start();
                match recv_signal.wait() {
                    Outcome::Value(n) => n,
                    outcome => panic!("recv failed: {:?}", outcome),
                }
            };
            assert!(n > 0 && n <= 3);
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"abcdefgh");

        context.request_stop();
        handle.join().unwrap().expect("run failed");
    });
}

// Scatter/gather variants go through recvmsg/sendmsg instead of recv/send.
#[test]
fn vectored_recv_and_send() {
    init();

    let context = Context::new().expect("unable to create context");
    let listener = TcpListener::bind(any_addr()).expect("unable to bind listener");
    let addr = listener.local_addr().expect("unable to get local addr");

    thread::scope(|scope| {
        let handle = scope.spawn(|| context.run());

        let peer = scope.spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).expect("unable to connect");
            stream.write_all(b"hello world").expect("unable to write");

            let mut echoed = [0u8; 6];
            stream.read_exact(&mut echoed).expect("unable to read");
            assert_eq!(&echoed, b"foobar");
        });

        let accept_signal = Signal::new();
        let mut accept = pin!(async_accept(context.scheduler(), &listener)
            .connect(TestReceiver::new(&accept_signal)));
        accept.as_mut().start();
        let stream: TcpStream = match accept_signal.wait() {
            Outcome::Value(stream) => stream,
            outcome => panic!("accept did not produce a socket: {:?}", outcome),
        };

        // Read into two disjoint halves of one buffer.
        let mut buf = [0u8; 32];
        let n = {
            let (head, tail) = buf.split_at_mut(5);
            let mut bufs = [IoSliceMut::new(head), IoSliceMut::new(tail)];
            let recv_signal = Signal::new();
            let mut recv = pin!(async_recv_some(context.scheduler(), &stream, &mut bufs[..])
                .connect(TestReceiver::new(&recv_signal)));
            recv.as_mut().start();
            match recv_signal.wait() {
                Outcome::Value(n) => n,
                outcome => panic!("recv failed: {:?}", outcome),
            }
        };
        assert_eq!(&buf[..n], b"hello world");

        // Write a reply gathered from two pieces.
        let bufs = [IoSlice::new(b"foo"), IoSlice::new(b"bar")];
        let send_signal = Signal::new();
        let mut send = pin!(async_send_some(context.scheduler(), &stream, &bufs[..])
            .connect(TestReceiver::new(&send_signal)));
        send.as_mut().start();
        assert_eq!(send_signal.wait(), Outcome::Value(6));

        peer.join().unwrap();
        context.request_stop();
        handle.join().unwrap().expect("run failed");
    });
}

// The timeout idiom: a recv races a timer, and whichever completes first
// stops the other through its stop source. Exactly one signal lands on each
// operation either way.
#[test]
fn recv_with_timer_timeout_delivers_stopped() {
    init();

    struct StopPeerOnValue {
        target: Arc<StopSource>,
        signal: Signal<()>,
        stop_token: exio::StopToken,
    }

    impl Receiver for StopPeerOnValue {
        type Value = ();

        fn set_value(self, _: ()) {
            self.target.request_stop();
            self.signal.set(Outcome::Value(()));
        }

        fn set_error(self, error: Error) {
            self.signal.set(Outcome::Error(error));
        }

        fn set_stopped(self) {
            self.signal.set(Outcome::Stopped);
        }

        fn stop_token(&self) -> exio::StopToken {
            self.stop_token.clone()
        }
    }

    let context = Context::new().expect("unable to create context");
    let listener = TcpListener::bind(any_addr()).expect("unable to bind listener");
    let addr = listener.local_addr().expect("unable to get local addr");

    thread::scope(|scope| {
        let handle = scope.spawn(|| context.run());

        // Connected but silent peer: the recv can only lose the race.
        let peer = std::net::TcpStream::connect(addr).expect("unable to connect");

        let accept_signal = Signal::new();
        let mut accept = pin!(async_accept(context.scheduler(), &listener)
            .connect(TestReceiver::new(&accept_signal)));
        accept.as_mut().start();
        let stream: TcpStream = match accept_signal.wait() {
            Outcome::Value(stream) => stream,
            outcome => panic!("accept did not produce a socket: {:?}", outcome),
        };

        let recv_source = Arc::new(StopSource::new());
        let timer_source = StopSource::new();

        let mut buf = [0u8; 16];
        let recv_signal = Signal::new();
        let mut recv = pin!(async_recv_some(context.scheduler(), &stream, &mut buf[..])
            .connect(TestReceiver::with_token(&recv_signal, recv_source.token())));
        recv.as_mut().start();

        let timer_signal = Signal::new();
        let mut timer = pin!(context
            .scheduler()
            .schedule_after(Duration::from_millis(100))
            .connect(StopPeerOnValue {
                target: recv_source.clone(),
                signal: timer_signal.clone(),
                stop_token: timer_source.token(),
            }));
        timer.as_mut().start();

        let started = Instant::now();
        assert_eq!(timer_signal.wait(), Outcome::Value(()));
        assert_eq!(recv_signal.wait(), Outcome::Stopped);
        assert!(started.elapsed() >= Duration::from_millis(90));

        drop(peer);
        context.request_stop();
        handle.join().unwrap().expect("run failed");
    });
}

// Fill the send buffer until the socket pushes back, then check that an
// armed send completes once the peer drains.
#[test]
fn send_resumes_after_would_block() {
    init();

    let context = Context::new().expect("unable to create context");
    let listener = TcpListener::bind(any_addr()).expect("unable to bind listener");
    let addr = listener.local_addr().expect("unable to get local addr");

    thread::scope(|scope| {
        let handle = scope.spawn(|| context.run());

        let mut peer = std::net::TcpStream::connect(addr).expect("unable to connect");

        let accept_signal = Signal::new();
        let mut accept = pin!(async_accept(context.scheduler(), &listener)
            .connect(TestReceiver::new(&accept_signal)));
        accept.as_mut().start();
        let stream: TcpStream = match accept_signal.wait() {
            Outcome::Value(stream) => stream,
            outcome => panic!("accept did not produce a socket: {:?}", outcome),
        };

        // Saturate the kernel buffers with the synchronous verb.
        let chunk = [0u8; 64 * 1024];
        loop {
            match stream.non_blocking_send(&chunk, 0) {
                Ok(_) => continue,
                Err(err) if err.is_would_block() => break,
                Err(err) => panic!("unable to fill send buffer: {}", err),
            }
        }

        // This send must arm and wait for writable readiness.
        let send_signal = Signal::new();
        let mut send = pin!(async_send_some(context.scheduler(), &stream, &chunk[..])
            .connect(TestReceiver::new(&send_signal)));
        send.as_mut().start();
        thread::sleep(Duration::from_millis(50));
        assert!(!send_signal.is_completed());

        // Drain from the peer until the armed send goes through.
        let mut sink = vec![0u8; 256 * 1024];
        let sent = loop {
            peer.read(&mut sink).expect("unable to drain");
            match send_signal.try_take() {
                Some(Outcome::Value(n)) => break n,
                Some(outcome) => panic!("send failed: {:?}", outcome),
                None => continue,
            }
        };
        assert!(sent > 0);

        context.request_stop();
        handle.join().unwrap().expect("run failed");
    });
}
