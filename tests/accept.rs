//! Accept path: listener registration through endpoint creation.

mod common;

use std::io::Write;
use std::sync::atomic::Ordering;
use std::time::Duration;

use muxio::{net, Config, Interests};

use common::{loop_thread_id, start_selector, Event};

#[test]
fn accepts_and_builds_endpoint() {
    let fixture = start_selector(Config::default());

    let listener = net::bind_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
    let addr = listener.local_addr().unwrap();
    fixture.handle.register_acceptor(listener);

    let client = std::net::TcpStream::connect(addr).unwrap();

    assert!(
        fixture.manager.wait_for(Duration::from_secs(2), |m| {
            m.count(|e| *e == Event::ConnectionOpened) == 1
        }),
        "connection never opened: {:?}",
        fixture.manager.events()
    );

    // factory and notification order: endpoint before connection
    let events = fixture.manager.events();
    let pos = |wanted: Event| events.iter().position(|e| *e == wanted).unwrap();
    assert!(pos(Event::Accepted) < pos(Event::NewEndpoint));
    assert!(pos(Event::NewEndpoint) < pos(Event::EndpointOpened));
    assert!(pos(Event::EndpointOpened) < pos(Event::NewConnection));
    assert!(pos(Event::NewConnection) < pos(Event::ConnectionOpened));

    drop(client);
    fixture.handle.stop();
}

#[test]
fn endpoint_receives_data_after_update_key() {
    let fixture = start_selector(Config::default());

    let listener = net::bind_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
    let addr = listener.local_addr().unwrap();
    fixture.handle.register_acceptor(listener);

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    assert!(fixture
        .manager
        .wait_for(Duration::from_secs(2), |m| !m.endpoints.lock().unwrap().is_empty()));

    // The endpoint asked for read interest in update_key; written bytes
    // must reach on_selected.
    client.write_all(b"ping").unwrap();
    client.flush().unwrap();

    assert!(
        fixture.manager.wait_for(Duration::from_secs(2), |m| {
            let endpoints = m.endpoints.lock().unwrap();
            endpoints
                .first()
                .map(|ep| ep.data.lock().unwrap().as_slice() == b"ping")
                .unwrap_or(false)
        }),
        "endpoint never observed the client's bytes"
    );

    // on_selected ran on the loop thread
    let loop_id = loop_thread_id(&fixture.handle);
    let selected_on = fixture
        .manager
        .selected_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("on_selected never fired");
    assert_eq!(selected_on, loop_id);

    fixture.handle.stop();
}

#[test]
fn accept_attachment_reaches_new_connection() {
    let fixture = start_selector(Config::default());

    // Hand a pre-connected pair straight to the accept change.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    let stream = mio::net::TcpStream::from_std(server);

    fixture.handle.accept(stream, Some(Box::new(7u32)));

    assert!(fixture.manager.wait_for(Duration::from_secs(2), |m| {
        m.count(|e| *e == Event::ConnectionOpened) == 1
    }));
    assert_eq!(*fixture.manager.last_attachment.lock().unwrap(), Some(7));

    drop(client);
    fixture.handle.stop();
}

#[test]
fn factory_callbacks_run_on_loop_thread() {
    let fixture = start_selector(Config::default());
    let loop_id = loop_thread_id(&fixture.handle);

    let listener = net::bind_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
    let addr = listener.local_addr().unwrap();
    fixture.handle.register_acceptor(listener);
    let _client = std::net::TcpStream::connect(addr).unwrap();

    assert!(fixture.manager.wait_for(Duration::from_secs(2), |m| {
        m.count(|e| *e == Event::ConnectionOpened) == 1
    }));
    for (event, thread) in fixture.manager.event_threads() {
        assert_eq!(thread, loop_id, "{event:?} ran off the loop thread");
    }
    fixture.handle.stop();
}

#[test]
fn panicking_endpoint_does_not_kill_loop() {
    let fixture = start_selector(Config::default());

    let listener = net::bind_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
    let addr = listener.local_addr().unwrap();
    fixture.handle.register_acceptor(listener);

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    assert!(fixture
        .manager
        .wait_for(Duration::from_secs(2), |m| !m.endpoints.lock().unwrap().is_empty()));

    let endpoint = fixture.manager.endpoints.lock().unwrap()[0].clone();
    endpoint.panic_on_selected.store(true, Ordering::Release);
    client.write_all(b"boom").unwrap();

    // the loop closes the faulty endpoint and keeps serving
    assert!(
        fixture
            .manager
            .wait_for(Duration::from_secs(2), |_| endpoint.closed.load(Ordering::Acquire)),
        "faulty endpoint was not closed"
    );

    let mut second = std::net::TcpStream::connect(addr).unwrap();
    assert!(
        fixture.manager.wait_for(Duration::from_secs(2), |m| {
            m.count(|e| *e == Event::ConnectionOpened) == 2
        }),
        "loop stopped accepting after an endpoint panic"
    );
    second.write_all(b"ok").unwrap();

    fixture.handle.stop();
}

#[test]
fn interest_ops_can_be_rewritten_through_tasks() {
    let fixture = start_selector(Config::default());

    let listener = net::bind_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
    let addr = listener.local_addr().unwrap();
    fixture.handle.register_acceptor(listener);
    let _client = std::net::TcpStream::connect(addr).unwrap();

    assert!(fixture.manager.wait_for(Duration::from_secs(2), |m| {
        m.count(|e| *e == Event::ConnectionOpened) == 1
    }));

    let (tx, rx) = crossbeam_channel::unbounded();
    fixture.handle.submit_task(move |selector| {
        // two keys: the acceptor and the accepted stream
        let _ = tx.send(selector.key_count());
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);

    let (tx, rx) = crossbeam_channel::unbounded();
    fixture.handle.submit_task(move |selector| {
        // flip the accepted stream to read+write and report back
        for token in [mio::Token(0), mio::Token(1)] {
            if selector.interests(token) == Some(Interests::READ) {
                selector
                    .set_interests(token, Interests::READ | Interests::WRITE)
                    .unwrap();
                let _ = tx.send(selector.interests(token));
                return;
            }
        }
        let _ = tx.send(None);
    });
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        Some(Interests::READ | Interests::WRITE)
    );

    fixture.handle.stop();
}
