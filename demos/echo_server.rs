//! A minimal TCP echo server.
//!
//! Serves one client at a time on port 12312: accept, then echo every chunk
//! back until the peer shuts down. Run it and poke it with
//! `nc 127.0.0.1 12312`.

use std::pin::pin;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use exio::net::TcpListener;
use exio::{
    async_accept, async_recv_some, async_send_some, Context, Error, OperationState, Receiver,
    Sender,
};

const ECHO_PORT: u16 = 12312;

enum Outcome<V> {
    Value(V),
    Error(Error),
    Stopped,
}

/// Receiver writing its completion into a shared slot.
struct Mailbox<V> {
    slot: Arc<(Mutex<Option<Outcome<V>>>, Condvar)>,
}

impl<V: Send> Receiver for Mailbox<V> {
    type Value = V;

    fn set_value(self, value: V) {
        self.deliver(Outcome::Value(value));
    }

    fn set_error(self, error: Error) {
        self.deliver(Outcome::Error(error));
    }

    fn set_stopped(self) {
        self.deliver(Outcome::Stopped);
    }
}

impl<V> Mailbox<V> {
    fn deliver(self, outcome: Outcome<V>) {
        let (slot, cond) = &*self.slot;
        *slot.lock().expect("mailbox poisoned") = Some(outcome);
        cond.notify_one();
    }
}

/// Start `sender` and block until its completion arrives.
///
/// `Ok(None)` reports a stopped operation, mirroring what a sync-wait
/// algorithm does in a full sender/receiver library.
fn sync_wait<S>(sender: S) -> Result<Option<S::Value>, Error>
where
    S: Sender,
    S::Value: Send,
{
    let slot = Arc::new((Mutex::new(None), Condvar::new()));
    let mut op = pin!(sender.connect(Mailbox { slot: slot.clone() }));
    op.as_mut().start();

    let (lock, cond) = &*slot;
    let mut guard = lock.lock().expect("mailbox poisoned");
    loop {
        match guard.take() {
            Some(Outcome::Value(value)) => return Ok(Some(value)),
            Some(Outcome::Error(error)) => return Err(error),
            Some(Outcome::Stopped) => return Ok(None),
            None => guard = cond.wait(guard).expect("mailbox poisoned"),
        }
    }
}

fn main() {
    env_logger::init();

    let context = Context::new().expect("unable to create context");
    let listener =
        TcpListener::bind(format!("0.0.0.0:{}", ECHO_PORT).parse().unwrap())
            .expect("unable to bind listener");
    println!("server file descriptor: {}", listener.native_handle());
    println!("server listen port: {}", ECHO_PORT);

    thread::scope(|scope| {
        scope.spawn(|| context.run().expect("unable to run context"));
        let scheduler = context.scheduler();

        loop {
            let stream = match sync_wait(async_accept(scheduler, &listener)) {
                Ok(Some(stream)) => stream,
                Ok(None) => break,
                Err(err) => {
                    eprintln!("accept failed: {}", err);
                    continue;
                }
            };
            match stream.peer_addr() {
                Ok(peer) => println!("accepted connection from {}", peer),
                Err(err) => println!("accepted connection (peer unknown: {})", err),
            }

            let mut buf = [0u8; 4096];
            loop {
                let n = match sync_wait(async_recv_some(scheduler, &stream, &mut buf[..])) {
                    Ok(Some(n)) => n,
                    Ok(None) => break,
                    Err(Error::Eof) => {
                        println!("peer closed the connection");
                        break;
                    }
                    Err(err) => {
                        eprintln!("recv failed: {}", err);
                        break;
                    }
                };

                // Echo the whole chunk back; sends may be short.
                let mut sent = 0;
                while sent < n {
                    match sync_wait(async_send_some(scheduler, &stream, &buf[sent..n])) {
                        Ok(Some(m)) => sent += m,
                        Ok(None) => break,
                        Err(err) => {
                            eprintln!("send failed: {}", err);
                            break;
                        }
                    }
                }
            }
        }

        context.request_stop();
    });
}
