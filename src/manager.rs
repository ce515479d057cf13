//! Shared management service.
//!
//! Containerised workloads ask the host to stop, kill, or destroy themselves,
//! or to forward a TCP port, by sending plain HTTP where the request *method*
//! is the verb. The service authorises peers with an IP allow-list populated
//! from `ContainerRegistered` bus events; everyone else gets 403.

use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::PortRange;
use crate::docker::ContainerEngine;
use crate::error::GatewayError;
use crate::events::{EventBus, ServerEvent};

const VERB_STOP: &str = "STOP";
const VERB_KILL: &str = "KILL";
const VERB_DESTROY: &str = "DESTROY";
const VERB_PORT: &str = "PORT";

/// A container admitted to the management service.
#[derive(Debug, Clone)]
struct Registration {
    container_id: String,
    ports: Option<PortRange>,
}

type Registrations = Arc<RwLock<HashMap<IpAddr, Registration>>>;

/// Url-encoded body of a PORT request.
#[derive(Debug, Deserialize)]
struct PortForm {
    from: String,
    to: String,
}

enum PortReject {
    NoPolicy,
    BadSource(String),
    BadDestination,
}

/// Bind the management service and serve until `cancel` fires. Returns the
/// bound address.
pub async fn start(
    engine: Arc<ContainerEngine>,
    bus: EventBus<ServerEvent>,
    address: &str,
    cancel: CancellationToken,
    tracker: &TaskTracker,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(GatewayError::ManagerBind)?;
    let local = listener.local_addr().map_err(GatewayError::ManagerBind)?;
    info!("Management service listening on {local}");

    let registrations: Registrations = Arc::new(RwLock::new(HashMap::new()));

    // The allow-list is mutated only by this subscription.
    let mut events = bus.subscribe();
    let table = registrations.clone();
    let registration_cancel = cancel.clone();
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = registration_cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(ServerEvent::ContainerRegistered { container_id, ip, ports }) => {
                        info!("Registered container {container_id} at {ip} with the manager");
                        table.write().await.insert(
                            ip,
                            Registration {
                                container_id,
                                ports,
                            },
                        );
                    }
                    Ok(_) => {}
                    Err(_) => return,
                },
            }
        }
    });

    let accept_tracker = tracker.clone();
    tracker.spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!("Management service accept error: {err}");
                        continue;
                    }
                },
            };

            let engine = engine.clone();
            let bus = bus.clone();
            let registrations = registrations.clone();
            accept_tracker.spawn(async move {
                let service = service_fn(move |request| {
                    let engine = engine.clone();
                    let bus = bus.clone();
                    let registrations = registrations.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            handle(request, peer.ip(), engine, bus, registrations).await,
                        )
                    }
                });
                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Management connection from {peer} ended: {err}");
                }
            });
        }
    });

    Ok(local)
}

async fn handle(
    request: Request<Incoming>,
    peer: IpAddr,
    engine: Arc<ContainerEngine>,
    bus: EventBus<ServerEvent>,
    registrations: Registrations,
) -> Response<Full<Bytes>> {
    let Some(registration) = registrations.read().await.get(&peer).cloned() else {
        warn!("Management request from unregistered peer {peer}");
        return respond(StatusCode::FORBIDDEN, "Unknown container");
    };
    let container_id = registration.container_id.clone();

    match request.method().as_str() {
        VERB_STOP => {
            info!("Received STOP signal from container {container_id}");
            if let Err(err) = engine.stop(&container_id).await {
                warn!("{err:#}");
            }
        }
        VERB_KILL => {
            info!("Received KILL signal from container {container_id}");
            if let Err(err) = engine.kill(&container_id).await {
                warn!("{err:#}");
            }
        }
        VERB_DESTROY => {
            info!("Received DESTROY signal from container {container_id}");
            if let Err(err) = engine.destroy(&container_id).await {
                warn!("{err:#}");
            }
        }
        VERB_PORT => {
            info!("Received PORT forwarding request from container {container_id}");
            let Ok(body) = request.into_body().collect().await else {
                return respond(StatusCode::BAD_REQUEST, "Invalid body");
            };
            let form: PortForm = match serde_urlencoded::from_bytes(&body.to_bytes()) {
                Ok(form) => form,
                Err(_) => return respond(StatusCode::BAD_REQUEST, "Invalid body"),
            };
            match validate_port_request(&form, registration.ports) {
                Ok((src_port, dst_port)) => {
                    bus.publish(ServerEvent::PortForwardRequest {
                        src_port,
                        dst_port,
                        dst: peer,
                    });
                }
                Err(PortReject::NoPolicy) => {
                    return Response::builder()
                        .status(StatusCode::METHOD_NOT_ALLOWED)
                        .body(Full::default())
                        .unwrap();
                }
                Err(PortReject::BadSource(diag)) => {
                    return respond(StatusCode::BAD_REQUEST, &diag);
                }
                Err(PortReject::BadDestination) => {
                    return respond(StatusCode::BAD_REQUEST, "Invalid destination port");
                }
            }
        }
        other => {
            debug!("Ignoring management verb {other} from container {container_id}");
        }
    }

    respond(StatusCode::OK, "")
}

fn respond(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn validate_port_request(
    form: &PortForm,
    policy: Option<PortRange>,
) -> std::result::Result<(u16, u16), PortReject> {
    let Some(range) = policy else {
        return Err(PortReject::NoPolicy);
    };

    let src_port = form
        .from
        .parse::<u16>()
        .ok()
        .filter(|port| range.contains(*port))
        .ok_or_else(|| {
            PortReject::BadSource(format!(
                "From port {} is not allowed. Min: {}, max: {}",
                form.from, range.min_port, range.max_port
            ))
        })?;

    let dst_port = form
        .to
        .parse::<u16>()
        .ok()
        .filter(|port| *port >= 1)
        .ok_or(PortReject::BadDestination)?;

    Ok((src_port, dst_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn range(min: u16, max: u16) -> Option<PortRange> {
        Some(PortRange {
            min_port: min,
            max_port: max,
        })
    }

    fn form(from: &str, to: &str) -> PortForm {
        PortForm {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn port_request_validation() {
        assert_eq!(
            validate_port_request(&form("12345", "80"), range(10000, 20000)).ok(),
            Some((12345, 80))
        );
        assert!(matches!(
            validate_port_request(&form("80", "80"), range(10000, 20000)),
            Err(PortReject::BadSource(_))
        ));
        assert!(matches!(
            validate_port_request(&form("notaport", "80"), range(10000, 20000)),
            Err(PortReject::BadSource(_))
        ));
        assert!(matches!(
            validate_port_request(&form("12345", "0"), range(10000, 20000)),
            Err(PortReject::BadDestination)
        ));
        assert!(matches!(
            validate_port_request(&form("12345", "70000"), range(10000, 20000)),
            Err(PortReject::BadDestination)
        ));
        assert!(matches!(
            validate_port_request(&form("12345", "80"), None),
            Err(PortReject::NoPolicy)
        ));
    }

    async fn started_service(bus: EventBus<ServerEvent>) -> SocketAddr {
        let engine = Arc::new(
            ContainerEngine::disconnected().expect("docker client handle"),
        );
        let tracker = TaskTracker::new();
        start(
            engine,
            bus,
            "127.0.0.1:0",
            CancellationToken::new(),
            &tracker,
        )
        .await
        .unwrap()
    }

    fn verb(method: &str) -> reqwest::Method {
        reqwest::Method::from_bytes(method.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn unregistered_peer_is_forbidden() {
        let bus = EventBus::new();
        let addr = started_service(bus).await;

        let response = reqwest::Client::new()
            .request(verb("STOP"), format!("http://{addr}/"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn port_request_opens_a_forward_event() {
        let bus: EventBus<ServerEvent> = EventBus::new();
        let mut events = bus.subscribe();
        let addr = started_service(bus.clone()).await;

        bus.publish(ServerEvent::ContainerRegistered {
            container_id: "c1".to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            ports: range(10000, 20000),
        });
        // Skip our own registration event and give the allow-list time to
        // pick it up.
        events.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = reqwest::Client::new();
        let response = client
            .request(verb("PORT"), format!("http://{addr}/"))
            .form(&[("from", "12345"), ("to", "80")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        match events.recv().await.unwrap() {
            ServerEvent::PortForwardRequest {
                src_port,
                dst_port,
                dst,
            } => {
                assert_eq!(src_port, 12345);
                assert_eq!(dst_port, 80);
                assert_eq!(dst, "127.0.0.1".parse::<IpAddr>().unwrap());
            }
            other => panic!("unexpected event {other:?}"),
        }

        let response = client
            .request(verb("PORT"), format!("http://{addr}/"))
            .form(&[("from", "99"), ("to", "80")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn port_without_policy_is_rejected() {
        let bus: EventBus<ServerEvent> = EventBus::new();
        let mut events = bus.subscribe();
        let addr = started_service(bus.clone()).await;

        bus.publish(ServerEvent::ContainerRegistered {
            container_id: "c1".to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            ports: None,
        });
        events.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let response = reqwest::Client::new()
            .request(verb("PORT"), format!("http://{addr}/"))
            .form(&[("from", "12345"), ("to", "80")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
