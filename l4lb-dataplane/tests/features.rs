mod common;

use std::sync::Arc;

use common::*;
use l4lb_common::{GlobalCounter, RealDefinition, StatsPair, VipFlags, DEFAULT_TTL};
use l4lb_dataplane::{Disposition, Lane, Settings, SharedDataplane, StateHandle};

#[test]
fn local_vip_goes_to_the_stack() {
    let state = base(2)
        .vip(vip("10.0.0.1", 80, TCP), meta(4, VipFlags::LOCAL_VIP), vec![1, 2])
        .build()
        .unwrap();
    let mut lane = lane(64);
    let frame = tcp4("1.2.3.4", 5555, "10.0.0.1", 80, SYN);
    let mut pkt = load(&frame);
    assert_eq!(lane.process(&state, &mut pkt, 0), Disposition::PassThrough);
    assert_eq!(pkt.data(), &frame[..]);

    let stats = lane.stats().view();
    assert_eq!(stats.vip(4), StatsPair { v1: 1, v2: 40 });
    assert_eq!(stats.global(GlobalCounter::Lru), StatsPair::zeroed());
}

#[test]
fn local_real_goes_to_the_stack_after_selection() {
    let state = base(1)
        .real(5, RealDefinition::new(addr("10.0.0.1"), true))
        .vip(vip("10.0.0.1", 80, TCP), meta(0, VipFlags::NONE), vec![5])
        .build()
        .unwrap();
    let mut lane = lane(64);
    let frame = tcp4("1.2.3.4", 5555, "10.0.0.1", 80, SYN);
    let mut pkt = load(&frame);
    assert_eq!(lane.process(&state, &mut pkt, 0), Disposition::PassThrough);
    assert_eq!(pkt.data(), &frame[..]);
    assert_eq!(lane.stats().view().real(5), StatsPair { v1: 1, v2: 40 });
}

fn quic_state() -> l4lb_dataplane::LoadBalancerState {
    base(2)
        .vip(vip("10.0.0.1", 443, UDP), meta(0, VipFlags::QUIC_VIP), vec![1, 1])
        .build()
        .unwrap()
}

#[test]
fn quic_connection_id_picks_the_real() {
    let state = quic_state();
    let mut lane = lane(64);
    // Short header, v1 connection id carrying server id 2.
    let short = udp4("1.2.3.4", 50000, "10.0.0.1", 443, &[0x40, 0x40, 0x00, 0x80, 0xde, 0xad]);
    assert_eq!(
        lane.process(&state, &mut load(&short), 0),
        Disposition::TxEncapsulated { real_id: 2 }
    );
    assert_eq!(
        lane.stats().view().global(GlobalCounter::QuicRouting),
        StatsPair { v1: 1, v2: 0 }
    );
    // Routed by id: no affinity work.
    assert_eq!(lane.stats().view().global(GlobalCounter::Lru).v2, 0);
}

#[test]
fn unusable_quic_ids_fall_back_to_the_ring() {
    let state = quic_state();
    let mut lane = lane(64);
    let unknown_server = udp4("1.2.3.4", 50000, "10.0.0.1", 443, &[0x40, 0x40, 0x01, 0xc0]);
    let long_header = udp4("1.2.3.4", 50001, "10.0.0.1", 443, &[0xc0, 0x40, 0x00, 0x80]);
    let too_short = udp4("1.2.3.4", 50002, "10.0.0.1", 443, &[0x40]);
    for frame in [unknown_server, long_header, too_short] {
        assert_eq!(
            lane.process(&state, &mut load(&frame), 0),
            Disposition::TxEncapsulated { real_id: 1 }
        );
    }
    assert_eq!(
        lane.stats().view().global(GlobalCounter::QuicRouting),
        StatsPair { v1: 0, v2: 3 }
    );
}

#[test]
fn source_routing_overrides_the_ring() {
    let state = base(2)
        .vip(vip("10.0.0.1", 80, TCP), meta(0, VipFlags::SRC_ROUTING), vec![1, 1])
        .src_route("1.2.0.0/16".parse().unwrap(), 2)
        .build()
        .unwrap();
    let mut lane = lane(64);

    let routed = tcp4("1.2.3.4", 5555, "10.0.0.1", 80, SYN);
    assert_eq!(
        lane.process(&state, &mut load(&routed), 0),
        Disposition::TxEncapsulated { real_id: 2 }
    );
    let hashed = tcp4("5.6.7.8", 5555, "10.0.0.1", 80, SYN);
    assert_eq!(
        lane.process(&state, &mut load(&hashed), 0),
        Disposition::TxEncapsulated { real_id: 1 }
    );
    assert_eq!(
        lane.stats().view().global(GlobalCounter::LpmSrc),
        StatsPair { v1: 1, v2: 1 }
    );
}

#[test]
fn flood_stops_affinity_writes_and_source_routing() {
    let settings = Settings {
        ring_size: 1,
        max_conn_rate: 2,
        ..Settings::default()
    };
    let build = |ring: Vec<u32>| {
        l4lb_dataplane::StateBuilder::new()
            .settings(settings.clone())
            .gateway_mac(GATEWAY)
            .real(1, real("10.1.0.1"))
            .real(2, real("10.1.0.2"))
            .vip(vip("10.0.0.1", 80, TCP), meta(0, VipFlags::SRC_ROUTING), ring)
            .src_route("203.0.113.0/24".parse().unwrap(), 2)
            .build()
            .unwrap()
    };
    let handle = StateHandle::new(build(vec![1]));
    let mut lane = lane(64);

    let a = |flags| tcp4("198.51.100.1", 1000, "10.0.0.1", 80, flags);
    let b = |flags| tcp4("198.51.100.2", 1000, "10.0.0.1", 80, flags);
    let c = |flags| tcp4("203.0.113.3", 1000, "10.0.0.1", 80, flags);

    assert_eq!(
        lane.process(&handle.load(), &mut load(&a(SYN)), 0),
        Disposition::TxEncapsulated { real_id: 1 }
    );
    assert_eq!(
        lane.process(&handle.load(), &mut load(&b(SYN)), 0),
        Disposition::TxEncapsulated { real_id: 1 }
    );
    // Third packet in the window: the source route for C is not consulted
    // and nothing is cached.
    assert_eq!(
        lane.process(&handle.load(), &mut load(&c(SYN)), 0),
        Disposition::TxEncapsulated { real_id: 1 }
    );
    let stats = lane.stats().view();
    assert_eq!(stats.global(GlobalCounter::NewConnRate), StatsPair { v1: 1, v2: 1 });
    assert_eq!(stats.global(GlobalCounter::LpmSrc), StatsPair { v1: 0, v2: 2 });

    handle.publish(build(vec![2]));
    assert_eq!(
        lane.process(&handle.load(), &mut load(&a(ACK)), 0),
        Disposition::TxEncapsulated { real_id: 1 }
    );
    assert_eq!(
        lane.process(&handle.load(), &mut load(&c(ACK)), 0),
        Disposition::TxEncapsulated { real_id: 2 }
    );
}

#[test]
fn lanes_without_a_shard_share_the_fallback() {
    let shared = Arc::new(SharedDataplane::new(256, 4));
    let mut first = Lane::new(0, 0, shared.clone());
    let mut second = Lane::new(1, 0, shared);
    let handle = StateHandle::new(pinned_state());

    let syn = tcp4("1.2.3.4", 5555, "10.0.0.1", 80, SYN);
    let ack = tcp4("1.2.3.4", 5555, "10.0.0.1", 80, ACK);
    assert_eq!(
        first.process(&handle.load(), &mut load(&syn), 0),
        Disposition::TxEncapsulated { real_id: 2 }
    );
    handle.publish(
        base(2)
            .vip(vip("10.0.0.1", 80, TCP), meta(0, VipFlags::NONE), vec![1, 1])
            .build()
            .unwrap(),
    );
    // The entry written by the first lane answers for the second.
    assert_eq!(
        second.process(&handle.load(), &mut load(&ack), 1),
        Disposition::TxEncapsulated { real_id: 2 }
    );
    assert_eq!(first.stats().view().global(GlobalCounter::FallbackLru).v1, 1);
    assert_eq!(second.stats().view().global(GlobalCounter::FallbackLru).v1, 1);
    assert_eq!(second.id(), 1);
}

#[test]
fn lanes_with_shards_do_not_share_entries() {
    let shared = Arc::new(SharedDataplane::new(256, 4));
    let mut first = Lane::new(0, 64, shared.clone());
    let mut second = Lane::new(1, 64, shared);
    let handle = StateHandle::new(pinned_state());

    let syn = tcp4("1.2.3.4", 5555, "10.0.0.1", 80, SYN);
    let ack = tcp4("1.2.3.4", 5555, "10.0.0.1", 80, ACK);
    first.process(&handle.load(), &mut load(&syn), 0);
    handle.publish(
        base(2)
            .vip(vip("10.0.0.1", 80, TCP), meta(0, VipFlags::NONE), vec![1, 1])
            .build()
            .unwrap(),
    );
    assert_eq!(
        second.process(&handle.load(), &mut load(&ack), 1),
        Disposition::TxEncapsulated { real_id: 1 }
    );
    assert_eq!(second.stats().view().global(GlobalCounter::FallbackLru), StatsPair::zeroed());
}

#[test]
fn echo_request_is_answered_in_place() {
    let state = pinned_state();
    let mut lane = lane(64);
    let frame = echo4("1.2.3.4", "10.0.0.1");
    let mut pkt = load(&frame);
    assert_eq!(lane.process(&state, &mut pkt, 0), Disposition::EchoReply);

    let out = pkt.data();
    assert_eq!(out.len(), frame.len());
    assert_eq!(&out[0..6], &CLIENT_MAC);
    assert_eq!(&out[6..12], &LB_MAC);
    assert_eq!(&out[26..30], &[10, 0, 0, 1]);
    assert_eq!(&out[30..34], &[1, 2, 3, 4]);
    assert_eq!(out[22], DEFAULT_TTL);
    assert_eq!(internet_checksum(&out[14..34]), 0);
    assert_eq!(out[34], 0);
    assert_eq!(internet_checksum(&out[34..]), 0);
    assert_eq!(
        lane.stats().view().global(GlobalCounter::IcmpEcho),
        StatsPair { v1: 1, v2: 0 }
    );
}

#[test]
fn frag_needed_follows_the_client_flow() {
    let state = pinned_state();
    let mut lane = lane(64);
    let ptb = frag_needed4("9.9.9.9", "10.0.0.1", 80, "1.2.3.4", 5555);
    let mut pkt = load(&ptb);
    assert_eq!(
        lane.process(&state, &mut pkt, 0),
        Disposition::TxEncapsulated { real_id: 2 }
    );
    assert_eq!(&pkt.data()[34..], &ptb[14..]);
    let stats = lane.stats().view();
    assert_eq!(stats.global(GlobalCounter::IcmpTooBig), StatsPair { v1: 1, v2: 0 });
    assert_eq!(stats.vip(0), StatsPair { v1: 1, v2: 56 });
}

#[test]
fn fallback_use_is_counted_once_per_packet() {
    let state = pinned_state();
    let mut lane = Lane::new(0, 0, Arc::new(SharedDataplane::new(256, 4)));
    let ack = tcp4("1.2.3.4", 5555, "10.0.0.1", 80, ACK);

    // Lookup misses, the ring answers and the pick is written back.
    assert_eq!(
        lane.process(&state, &mut load(&ack), 0),
        Disposition::TxEncapsulated { real_id: 2 }
    );
    assert_eq!(
        lane.stats().view().global(GlobalCounter::FallbackLru),
        StatsPair { v1: 1, v2: 0 }
    );

    assert_eq!(
        lane.process(&state, &mut load(&ack), 1),
        Disposition::TxEncapsulated { real_id: 2 }
    );
    let stats = lane.stats().view();
    assert_eq!(stats.global(GlobalCounter::FallbackLru), StatsPair { v1: 2, v2: 0 });
    assert_eq!(stats.global(GlobalCounter::LruMiss), StatsPair { v1: 0, v2: 1 });
}

#[test]
fn local_vip_packets_count_towards_the_flood_window() {
    let state = base(2)
        .settings(Settings {
            ring_size: 2,
            max_conn_rate: 2,
            ..Settings::default()
        })
        .vip(vip("10.0.0.2", 80, TCP), meta(1, VipFlags::LOCAL_VIP), vec![1, 1])
        .vip(vip("10.0.0.1", 80, TCP), meta(0, VipFlags::NONE), vec![1, 2])
        .build()
        .unwrap();
    let mut lane = lane(64);

    let local = tcp4("1.2.3.4", 5555, "10.0.0.2", 80, SYN);
    for _ in 0..2 {
        assert_eq!(lane.process(&state, &mut load(&local), 0), Disposition::PassThrough);
    }
    let syn = tcp4("1.2.3.4", 5555, "10.0.0.1", 80, SYN);
    assert_eq!(
        lane.process(&state, &mut load(&syn), 0),
        Disposition::TxEncapsulated { real_id: 2 }
    );
    // Third packet of the window: over the ceiling, so not cached.
    assert_eq!(
        lane.stats().view().global(GlobalCounter::NewConnRate),
        StatsPair { v1: 1, v2: 1 }
    );
}

#[test]
fn packet_too_big_follows_the_ipv6_client_flow() {
    let ring: Vec<u32> = (0..13).map(|i| 1 + i % 2).collect();
    let state = base(13)
        .vip(vip("2001:db8::80", 443, TCP), meta(0, VipFlags::NONE), ring)
        .build()
        .unwrap();

    let syn = tcp6("2001:db8:1::7", 40000, "2001:db8::80", 443, SYN);
    let Disposition::TxEncapsulated { real_id } = lane(64).process(&state, &mut load(&syn), 0) else {
        panic!("syn was not balanced");
    };

    // A fresh lane has nothing cached, so the pick comes from the recovered key.
    let mut lane = lane(64);
    let ptb = packet_too_big6("2001:db8:ffff::1", "2001:db8::80", 443, "2001:db8:1::7", 40000);
    let mut pkt = load(&ptb);
    assert_eq!(
        lane.process(&state, &mut pkt, 0),
        Disposition::TxEncapsulated { real_id }
    );
    // IPv6 inside IPv4.
    assert_eq!(pkt.data()[14 + 9], 41);
    assert_eq!(&pkt.data()[34..], &ptb[14..]);

    let stats = lane.stats().view();
    assert_eq!(stats.global(GlobalCounter::IcmpTooBig), StatsPair { v1: 0, v2: 1 });
    assert_eq!(stats.vip(0), StatsPair { v1: 1, v2: 96 });
}

#[test]
fn icmpv6_echo_request_is_answered_in_place() {
    let state = pinned_state();
    let mut lane = lane(64);
    let frame = echo6("2001:db8:1::7", "2001:db8::80");
    let mut pkt = load(&frame);
    assert_eq!(lane.process(&state, &mut pkt, 0), Disposition::EchoReply);

    let out = pkt.data();
    assert_eq!(out.len(), frame.len());
    assert_eq!(&out[0..6], &CLIENT_MAC);
    assert_eq!(&out[6..12], &LB_MAC);
    assert_eq!(&out[22..38], &v6("2001:db8::80").octets());
    assert_eq!(&out[38..54], &v6("2001:db8:1::7").octets());
    assert_eq!(out[21], DEFAULT_TTL);
    assert_eq!(out[54], 129);
    assert_eq!(icmp6_checksum(&out[22..38], &out[38..54], &out[54..]), 0);
    assert_eq!(
        lane.stats().view().global(GlobalCounter::IcmpEcho),
        StatsPair { v1: 0, v2: 1 }
    );
}
