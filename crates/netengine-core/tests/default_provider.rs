//! End-to-end lifecycle with the production collaborators.

#![cfg(target_os = "linux")]

use std::rc::Rc;

use netengine_core::tls::RustlsProvider;
use netengine_core::{EngineContext, EngineError, EventBackend, LifecycleState};
use netengine_test_utils::TestConfigBuilder;

#[test_log::test]
fn test_default_engine_lifecycle() {
    let config = TestConfigBuilder::new().nameserver("127.0.0.1").build();
    let ctx = EngineContext::init(&config).unwrap();

    assert_eq!(ctx.backend(), EventBackend::Epoll);
    assert_eq!(ctx.provider_name(), "default");
    assert!(ctx.has_tls_context());
    assert!(ctx.tls_client_config().is_ok());
    assert!(RustlsProvider::library_users() >= 1);

    let mut buf = [0u8; 32];
    ctx.fill_random(&mut buf).unwrap();
    assert!(buf.iter().any(|b| *b != 0));

    let fd = ctx
        .open_resolver_socket("127.0.0.1:53".parse().unwrap())
        .unwrap();
    let registered = ctx
        .with_subsystems(|s| s.multiplexer().is_registered(fd))
        .unwrap();
    assert!(registered);

    let summary = ctx.summary();
    assert_eq!(summary.nameservers, vec!["127.0.0.1:53".to_string()]);
    assert_eq!(summary.resolver_sockets, 1);
    assert_eq!(summary.registered_descriptors, 1);

    let alias = Rc::clone(&ctx);
    ctx.destroy().unwrap();
    assert_eq!(alias.state(), LifecycleState::Destroyed);
    assert!(EngineContext::current().is_none());
}

#[test_log::test]
fn test_missing_entropy_device_fails_init() {
    let config = TestConfigBuilder::new()
        .entropy_device("/nonexistent/netengine-random")
        .build();
    let err = EngineContext::init(&config).unwrap_err();

    assert!(matches!(err, EngineError::EntropyUnavailable { .. }));
    assert!(EngineContext::current().is_none());
}

#[test_log::test]
fn test_tls_disabled_engine() {
    let config = TestConfigBuilder::new().tls_enabled(false).build();
    let ctx = EngineContext::init(&config).unwrap();
    assert!(!ctx.has_tls_context());
    assert!(matches!(
        ctx.tls_client_config(),
        Err(EngineError::TlsContextUnavailable(_))
    ));
    ctx.destroy().unwrap();
}

#[test]
fn test_two_threads_get_separate_default_engines() {
    netengine_test_utils::init_test_tracing();
    let config = TestConfigBuilder::new().tls_enabled(false).build();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let config = config.clone();
            std::thread::spawn(move || {
                let ctx = EngineContext::init(&config).unwrap();
                let found = EngineContext::current().unwrap();
                assert!(Rc::ptr_eq(&ctx, &found));
                drop(found);
                ctx.destroy().unwrap();
                EngineContext::current().is_none()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
}

#[test_log::test]
fn test_empty_ca_bundle_runs_without_tls() {
    let bundle = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(bundle.path(), "# no certificates here\n").unwrap();

    let config = TestConfigBuilder::new().ca_file(bundle.path()).build();
    let ctx = EngineContext::init(&config).unwrap();

    assert_eq!(ctx.state(), LifecycleState::Running);
    assert!(!ctx.has_tls_context());
    let reason = ctx.tls_unavailable_reason().unwrap();
    assert!(reason.contains("no usable certificates"), "unexpected reason: {reason}");
    ctx.destroy().unwrap();
}
