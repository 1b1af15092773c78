//! Integration tests for the proxy controller: applying operations, round
//! robin dispatch across targets, and port/target teardown (spec §8).

use std::sync::Arc;
use std::time::Duration;

use dynproxy::{diff, Config, Controller, HealthCheckConfig};
use dynproxy::echodispatch::Unsupported;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_echo_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn new_controller() -> Controller {
    Controller::new(
        Arc::new(Unsupported),
        false,
        HealthCheckConfig {
            period: Duration::from_secs(60),
            max_exponent: 4,
        },
    )
}

#[tokio::test]
async fn applies_config_and_proxies_a_connection() {
    let target_port = spawn_echo_target().await;
    let controller = new_controller();

    let front_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut cfg = Config::default();
    cfg.rules.push(dynproxy::Rule {
        key: "r1".into(),
        ports: [front_port].into_iter().collect(),
        targets: [format!("127.0.0.1:{target_port}")].into_iter().collect(),
    });
    cfg.validate().unwrap();

    let ops = diff(&Config::default(), &cfg);
    controller.apply_diff(ops).await.unwrap();
    assert!(controller.has_rule("r1").await);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(("127.0.0.1", front_port)).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn remove_port_stops_accepting() {
    let target_port = spawn_echo_target().await;
    let controller = new_controller();
    let front_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut cfg = Config::default();
    cfg.rules.push(dynproxy::Rule {
        key: "r1".into(),
        ports: [front_port].into_iter().collect(),
        targets: [format!("127.0.0.1:{target_port}")].into_iter().collect(),
    });
    controller
        .apply_diff(diff(&Config::default(), &cfg))
        .await
        .unwrap();

    let mut empty_ports_cfg = cfg.clone();
    empty_ports_cfg.rules[0].ports.clear();
    controller
        .apply_diff(diff(&cfg, &empty_ports_cfg))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(("127.0.0.1", front_port)).await.is_err());
}

#[tokio::test]
async fn remove_rule_with_live_targets_is_rejected() {
    let controller = new_controller();
    controller
        .apply_operation(dynproxy::Operation::AddRule { key: "r1".into() })
        .await
        .unwrap();
    controller
        .apply_operation(dynproxy::Operation::AddTarget {
            key: "r1".into(),
            target: "127.0.0.1:1".into(),
        })
        .await
        .unwrap();

    let err = controller
        .apply_operation(dynproxy::Operation::RemoveRule { key: "r1".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, dynproxy::ProxyError::InternalIntegrity(_)));
}

#[tokio::test]
async fn duplicate_rule_and_missing_rule_errors() {
    let controller = new_controller();
    controller
        .apply_operation(dynproxy::Operation::AddRule { key: "r1".into() })
        .await
        .unwrap();

    let err = controller
        .apply_operation(dynproxy::Operation::AddRule { key: "r1".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, dynproxy::ProxyError::RuleAlreadyExist(_)));

    let err = controller
        .apply_operation(dynproxy::Operation::AddTarget {
            key: "missing".into(),
            target: "127.0.0.1:1".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, dynproxy::ProxyError::RuleNotExist(_)));
}
