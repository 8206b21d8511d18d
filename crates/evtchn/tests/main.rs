use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use evtchn::abi::{self, calls, status};
use evtchn::{
    DomainConfig, DomainId, EvtchnEngine, EvtchnError, Platform, Port, Progress, VcpuId, Virq,
};
use log::LevelFilter;

/// Snapshot testing
///
/// Checks that the given struct matches the provided snap!shot.
macro_rules! snap {
    ($snap:expr, $item:expr $(,)?) => {
        assert_eq!($snap, &format!("{}", $item));
    };
}

const A: DomainId = DomainId::new(1);
const B: DomainId = DomainId::new(2);

#[derive(Default)]
struct Recorder {
    wakes: Mutex<Vec<(DomainId, VcpuId)>>,
    preempt: AtomicBool,
}

impl Recorder {
    fn take(&self) -> Vec<(DomainId, VcpuId)> {
        std::mem::take(&mut *self.wakes.lock().unwrap())
    }
}

impl Platform for Recorder {
    fn wake(&self, domain: DomainId, vcpu: VcpuId) {
        self.wakes.lock().unwrap().push((domain, vcpu));
    }

    fn preempt_check(&self) -> bool {
        self.preempt.load(Ordering::SeqCst)
    }
}

fn setup() -> EvtchnEngine<Recorder> {
    logger::init(LevelFilter::Trace);
    EvtchnEngine::new(Recorder::default())
}

// ——————————————————————————————— Scenarios ———————————————————————————————— //

/// Two domains connect a pair of ports, signal each other and tear the pair down.
#[test]
fn scenario_interdomain() {
    let engine = setup();
    let a = engine.create_domain(A, DomainConfig::default()).unwrap();
    let config = DomainConfig {
        nr_vcpus: 2,
        ..DomainConfig::default()
    };
    let b = engine.create_domain(B, config).unwrap();

    let x = engine.alloc_unbound(A, DomainId::SELF, B, None).unwrap();
    snap!("{0: reserved, 1: unbound(d2) v0}", a.dump());

    let y = engine.bind_interdomain(B, A, x, None).unwrap();
    snap!("{0: reserved, 1: interdomain(d2:1) v0}", a.dump());
    snap!("{0: reserved, 1: interdomain(d1:1) v0 pending}", b.dump());

    // B moves the port to its second vCPU and consumes the bind event.
    engine.bind_vcpu(B, y, VcpuId::new(1)).unwrap();
    b.clear_pending(y).unwrap();
    b.vcpus()[0].ack_upcall();
    assert_eq!(engine.platform().take(), [(B, VcpuId::new(0))]);

    engine.send(A, x).unwrap();
    snap!("{0: reserved, 1: interdomain(d1:1) v1 pending}", b.dump());
    assert_eq!(engine.platform().take(), [(B, VcpuId::new(1))]);
    assert_eq!(b.vcpus()[1].take_pending_sel(), 1);

    let active = a.active_ports();
    engine.close(B, y).unwrap();
    snap!("{0: reserved, 1: unbound(d2) v0}", a.dump());
    snap!("{0: reserved}", b.dump());

    engine.close(A, x).unwrap();
    snap!("{0: reserved}", a.dump());
    assert_eq!(a.active_ports(), active - 1);
}

/// A VIRQ has a single owner until it is closed.
#[test]
fn scenario_virq() {
    let engine = setup();
    let _a = engine.create_domain(A, DomainConfig::default()).unwrap();

    let port = engine.bind_virq(A, Virq::TIMER, VcpuId::BOOT, None).unwrap();
    snap!("virq 0 on v0", engine.status(A, A, port).unwrap());
    assert_eq!(
        engine.bind_virq(A, Virq::TIMER, VcpuId::BOOT, None),
        Err(EvtchnError::AlreadyExists)
    );

    engine.close(A, port).unwrap();
    snap!("closed on v0", engine.status(A, A, port).unwrap());
    assert_eq!(
        engine.bind_virq(A, Virq::TIMER, VcpuId::BOOT, None),
        Ok(port)
    );
}

/// A preempted reset picks up where it stopped.
#[test]
fn scenario_reset() {
    let engine = setup();
    let a = engine.create_domain(A, DomainConfig::default()).unwrap();
    for _ in 0..150 {
        engine.bind_ipi(A, VcpuId::BOOT).unwrap();
    }

    engine.platform().preempt.store(true, Ordering::SeqCst);
    assert_eq!(engine.reset(A, A, false), Ok(Progress::Restart));
    assert_eq!(a.next_port(), 64);
    assert_eq!(engine.reset(A, A, true), Ok(Progress::Restart));
    assert_eq!(a.next_port(), 128);
    assert_eq!(a.active_ports(), 150 - 127);

    engine.platform().preempt.store(false, Ordering::SeqCst);
    assert_eq!(engine.reset(A, A, true), Ok(Progress::Done));
    assert_eq!(a.active_ports(), a.internal_ports());
    snap!("{0: reserved}", a.dump());
}

/// A dying domain is emptied, its peers are left waiting, and it is finally dropped.
#[test]
fn scenario_teardown() {
    let engine = setup();
    let a = engine.create_domain(A, DomainConfig::default()).unwrap();
    let b = engine.create_domain(B, DomainConfig::default()).unwrap();

    let x = engine.alloc_unbound(B, B, A, Some(Port::new(300))).unwrap();
    let y = engine.bind_interdomain(A, B, x, None).unwrap();
    engine.bind_ipi(A, VcpuId::BOOT).unwrap();
    engine.bind_virq(A, Virq::DOM_EXC, VcpuId::BOOT, None).unwrap();
    assert_eq!(y, Port::new(1));

    assert_eq!(engine.destroy_domain(A), Ok(Progress::Done));
    snap!("{0: reserved}", a.dump());
    snap!("unbound(d1) on v0", engine.status(B, B, x).unwrap());
    assert_eq!(engine.send(B, x), Ok(()));

    drop(a);
    assert_eq!(engine.reap_domain(A), Ok(()));
    assert_eq!(engine.domain_ids(), [B]);
    assert_eq!(b.active_ports(), 1);
}

/// The monitor-call surface maps requests and errors onto registers.
#[test]
fn scenario_monitor_calls() {
    let engine = setup();
    let _a = engine.create_domain(A, DomainConfig::default()).unwrap();
    let _b = engine.create_domain(B, DomainConfig::default()).unwrap();
    let this = DomainId::SELF.as_u16() as usize;
    let mut res = [0; 4];

    let args = [this, B.as_u16() as usize, 0, 0];
    let ret = abi::dispatch(&engine, A, calls::ALLOC_UNBOUND, &args, &mut res);
    assert_eq!(abi::return_code(ret), 0);
    let x = res[0];
    assert_eq!(x, 1);

    let args = [A.as_u16() as usize, x, 0, 0];
    let ret = abi::dispatch(&engine, B, calls::BIND_INTERDOMAIN, &args, &mut res);
    assert_eq!(ret, Ok(Progress::Done));
    let y = res[0];

    let ret = abi::dispatch(&engine, A, calls::STATUS, &[this, x, 0, 0], &mut res);
    assert_eq!(ret, Ok(Progress::Done));
    assert_eq!(res, [status::INTERDOMAIN, 0, B.as_u16() as usize, y]);

    let ret = abi::dispatch(&engine, A, calls::SEND, &[x, 0, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), 0);

    let ret = abi::dispatch(&engine, A, calls::BIND_VIRQ, &[0, 0, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), 0);
    let ret = abi::dispatch(&engine, A, calls::BIND_VIRQ, &[0, 0, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), -17);

    // Errors.
    let ret = abi::dispatch(&engine, A, 11, &[0; 4], &mut res);
    assert_eq!(abi::return_code(ret), -22);
    let ret = abi::dispatch(&engine, A, calls::CLOSE, &[5, 0, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), -22);
    let ret = abi::dispatch(&engine, A, calls::STATUS, &[70_000, 1, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), -22);
    let ret = abi::dispatch(&engine, A, calls::STATUS, &[9, 1, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), -3);
    let ret = abi::dispatch(&engine, A, calls::BIND_IPI, &[4, 0, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), -2);
    let ret = abi::dispatch(&engine, A, calls::SET_PRIORITY, &[x, 16, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), -22);
    let ret = abi::dispatch(&engine, A, calls::RESET_CONT, &[this, 0, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), -16);

    // Resets go through the continuation protocol.
    engine.platform().preempt.store(true, Ordering::SeqCst);
    let ret = abi::dispatch(&engine, A, calls::RESET, &[this, 0, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), abi::ERESTART);
    engine.platform().preempt.store(false, Ordering::SeqCst);
    let ret = abi::dispatch(&engine, A, calls::RESET_CONT, &[this, 0, 0, 0], &mut res);
    assert_eq!(abi::return_code(ret), 0);

    let ret = abi::dispatch(&engine, B, calls::STATUS, &[this, y, 0, 0], &mut res);
    assert_eq!(ret, Ok(Progress::Done));
    assert_eq!(res[0], status::UNBOUND);
    assert_eq!(res[2], A.as_u16() as usize);
}

#[test]
fn logs_reach_the_console() {
    let engine = setup();
    engine.create_domain(A, DomainConfig::default()).unwrap();
    engine.dump(A).unwrap();

    let mut out = vec![0; logger::CONSOLE_SIZE];
    let count = logger::read(&mut out);
    let text = String::from_utf8_lossy(&out[..count]);
    assert!(text.contains("evtchn"));
}
