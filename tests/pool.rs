//! End-to-end pool life-cycle tests, mirroring the shape of the teacher's
//! `tests/test_pool.rs`: build a real `Manager`, drive it through its public
//! surface only, and assert on what workers actually observed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ppm::{Manager, ManagerConfig};

fn recorder() -> (Arc<Mutex<Vec<(String, u32)>>>, impl Fn(u32, &ppm::WorkerContext<u32>) + Clone)
{
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler_log = log.clone();
    let handler = move |item: u32, ctx: &ppm::WorkerContext<u32>| {
        handler_log
            .lock()
            .unwrap()
            .push((ctx.name().to_string(), item));
    };
    (log, handler)
}

#[test]
fn happy_path_spawns_and_starts_every_worker() {
    let mut manager = Manager::new(
        ManagerConfig::new().pool_name("happy").max_workers(2),
        |_item: u32, _ctx: &_| {},
    );

    manager.start();

    assert_eq!(manager.created_workers().len(), 2);
    assert_eq!(manager.running_workers().len(), 2);

    manager.push_stop_signal(None);
    manager.wait().unwrap();
}

#[test]
fn broadcast_stop_reaches_every_worker_exactly_once() {
    let (log, handler) = recorder();
    let mut manager = Manager::new(
        ManagerConfig::new()
            .pool_name("broadcast")
            .max_workers(3)
            .fetch_delay(Duration::from_millis(1)),
        handler,
    );

    manager.start();
    manager.push_to_input_queue_broadcast(7, None);
    std::thread::sleep(Duration::from_millis(200));

    manager.push_stop_signal(None);
    manager.wait().unwrap();

    let entries = log.lock().unwrap();
    assert_eq!(entries.len(), 3, "every worker should have seen exactly one item");
    for (_, item) in entries.iter() {
        assert_eq!(*item, 7);
    }
    let mut names: Vec<&String> = entries.iter().map(|(name, _)| name).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 3, "each of the three workers recorded its own copy");
}

#[test]
fn random_single_dispatch_reaches_exactly_one_worker() {
    let (log, handler) = recorder();
    let mut manager = Manager::new(
        ManagerConfig::new()
            .pool_name("single")
            .max_workers(1)
            .fetch_delay(Duration::from_millis(1)),
        handler,
    );

    manager.start();
    manager.push_to_input_queue(99, None);
    std::thread::sleep(Duration::from_millis(150));

    manager.push_stop_signal(None);
    manager.wait().unwrap();

    let entries = log.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1, 99);
}

#[test]
fn wait_surfaces_the_first_worker_exception_and_empties_the_pool() {
    let mut manager = Manager::new(
        ManagerConfig::new()
            .pool_name("panicky")
            .max_workers(1)
            .fetch_delay(Duration::from_millis(1)),
        |item: u32, _ctx: &_| {
            if item == 13 {
                panic!("unlucky item");
            }
        },
    );

    manager.start();
    manager.push_to_input_queue(13, None);
    std::thread::sleep(Duration::from_millis(150));
    manager.push_stop_signal(None);

    let result = manager.wait();
    assert!(result.is_err());
    assert!(manager.created_workers().is_empty());
    assert!(manager.running_workers().is_empty());
}

#[test]
fn wait_control_token_pauses_and_resumes_a_worker() {
    let (log, handler) = recorder();
    let mut manager = Manager::new(
        ManagerConfig::new()
            .pool_name("pausing")
            .max_workers(1)
            .fetch_delay(Duration::from_millis(1)),
        handler,
    );

    manager.start();
    manager.push_wait_signal(None);
    std::thread::sleep(Duration::from_millis(50));

    // The worker is parked in `Waiting`; the next non-`wait` item it sees is
    // the one that resumes it, and that same item is the one it processes.
    manager.push_to_input_queue(1, None);
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(log.lock().unwrap().as_slice(), &[(manager.created_workers()[0].name().to_string(), 1)]);

    manager.push_to_input_queue(2, None);
    std::thread::sleep(Duration::from_millis(150));

    manager.push_stop_signal(None);
    manager.wait().unwrap();

    let entries = log.lock().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].1, 2);
}
