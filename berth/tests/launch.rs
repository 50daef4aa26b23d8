//! Integration tests for the launcher: bind exclusivity, fatal startup
//! failures and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use berth::{
    AppContext, Application, BerthError, BerthResult, BuildOptions, EntryPointError, EntryTarget,
    LaunchOptions, PortSpec, Response, Scope, ShutdownHandle, ShutdownKind,
};
use berth_test_utils::{ServiceProject, TestRuntime, free_port, http_get, wait_for_port};
use bytes::Bytes;
use hyper::StatusCode;
use tokio::net::TcpStream;

struct SlowApp {
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl Application for SlowApp {
    async fn call(&self, scope: Scope, _body: Bytes) -> Response {
        if scope.path == "/slow" {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Response::text(StatusCode::OK, format!("{} {}", scope.method, scope.path))
    }

    async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct FailingStartup;

#[async_trait]
impl Application for FailingStartup {
    async fn startup(&self, _ctx: &AppContext) -> BerthResult<()> {
        Err(BerthError::Config("DATABASE_URL is not set".into()))
    }

    async fn call(&self, _scope: Scope, _body: Bytes) -> Response {
        Response::text(StatusCode::OK, "unreachable")
    }
}

struct EnvEcho {
    greeting: parking_lot::Mutex<String>,
}

#[async_trait]
impl Application for EnvEcho {
    async fn startup(&self, ctx: &AppContext) -> BerthResult<()> {
        *self.greeting.lock() = ctx.env_var("GREETING").unwrap_or("none").to_string();
        assert!(ctx.working_dir.ends_with("app"));
        Ok(())
    }

    async fn call(&self, _scope: Scope, _body: Bytes) -> Response {
        Response::text(StatusCode::OK, self.greeting.lock().clone())
    }
}

async fn built_service() -> (TestRuntime, ServiceProject) {
    let project = ServiceProject::new("");
    let home = TestRuntime::new(Vec::new());
    home.runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap();
    (home, project)
}

fn on_port(port: u16) -> LaunchOptions {
    LaunchOptions {
        ports: vec![PortSpec {
            host_port: port,
            container_port: 8080,
        }],
        grace_period: Duration::from_secs(5),
        ..Default::default()
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn containers_left(home: &TestRuntime) -> usize {
    std::fs::read_dir(home.runtime.layout().containers_dir())
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_serves_requests_and_stops_gracefully() {
    let (home, _project) = built_service().await;
    let stopped = Arc::new(AtomicBool::new(false));
    home.runtime
        .entry_points()
        .register(
            "server:app",
            EntryTarget::application(SlowApp {
                stopped: Arc::clone(&stopped),
            }),
        )
        .unwrap();

    let port = free_port();
    let shutdown = ShutdownHandle::new();
    let container = home
        .runtime
        .start("svc:1", &on_port(port), shutdown.clone())
        .await
        .unwrap();
    assert!(container.status().get().is_running());
    let waiter = tokio::spawn(container.wait());

    let (status, body) = http_get(loopback(port), "/health").await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "GET /health");

    let in_flight = tokio::spawn(http_get(loopback(port), "/slow"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    shutdown.request();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(loopback(port)).await.is_err());

    let (status, body) = in_flight.await.unwrap().unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "GET /slow");

    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(outcome.shutdown, ShutdownKind::Graceful);
    assert_eq!(outcome.connections, 2);
    assert!(stopped.load(Ordering::SeqCst));
    assert_eq!(containers_left(&home), 0);
}

#[tokio::test]
async fn test_second_stop_forces_exit() {
    let (home, _project) = built_service().await;
    home.runtime
        .entry_points()
        .register(
            "server:app",
            EntryTarget::application(SlowApp {
                stopped: Arc::new(AtomicBool::new(false)),
            }),
        )
        .unwrap();

    let port = free_port();
    let shutdown = ShutdownHandle::new();
    let container = home
        .runtime
        .start("svc:1", &on_port(port), shutdown.clone())
        .await
        .unwrap();

    let waiter = tokio::spawn(container.wait());

    let in_flight = tokio::spawn(http_get(loopback(port), "/slow"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    shutdown.escalate();
    shutdown.escalate();
    let outcome = waiter.await.unwrap().unwrap();

    assert_eq!(outcome.shutdown, ShutdownKind::Forced);
    assert!(in_flight.await.unwrap().is_err());
}

#[tokio::test]
async fn test_port_in_use_is_a_startup_failure() {
    let (home, _project) = built_service().await;
    home.runtime
        .entry_points()
        .register(
            "server:app",
            EntryTarget::application(SlowApp {
                stopped: Arc::new(AtomicBool::new(false)),
            }),
        )
        .unwrap();

    let port = free_port();
    let _holder = std::net::TcpListener::bind(("0.0.0.0", port)).unwrap();

    let err = home
        .runtime
        .start("svc:1", &on_port(port), ShutdownHandle::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BerthError::PortInUse { .. }));
    assert!(err.is_startup_failure());
    assert_eq!(containers_left(&home), 0);
}

#[tokio::test]
async fn test_two_containers_cannot_share_a_port() {
    let (home, _project) = built_service().await;
    home.runtime
        .entry_points()
        .register(
            "server:app",
            EntryTarget::application(SlowApp {
                stopped: Arc::new(AtomicBool::new(false)),
            }),
        )
        .unwrap();

    let port = free_port();
    let shutdown = ShutdownHandle::new();
    let first = home
        .runtime
        .start("svc:1", &on_port(port), shutdown.clone())
        .await
        .unwrap();

    let second = home
        .runtime
        .start("svc:1", &on_port(port), ShutdownHandle::new())
        .await;
    assert!(matches!(second, Err(BerthError::PortInUse { .. })));

    shutdown.request();
    first.wait().await.unwrap();
}

#[tokio::test]
async fn test_missing_entry_point_never_binds() {
    let (home, _project) = built_service().await;
    let port = free_port();

    let err = home
        .runtime
        .start("svc:1", &on_port(port), ShutdownHandle::new())
        .await
        .err()
        .unwrap();

    assert!(matches!(
        err,
        BerthError::EntryPoint(EntryPointError::ModuleNotFound { .. })
    ));
    assert!(err.is_startup_failure());
    assert!(!wait_for_port(loopback(port), Duration::from_millis(200)).await);
    assert_eq!(containers_left(&home), 0);
}

#[tokio::test]
async fn test_failed_starts_leave_no_container_dirs() {
    let (home, _project) = built_service().await;

    for _ in 0..10 {
        let result = home
            .runtime
            .start("svc:1", &on_port(free_port()), ShutdownHandle::new())
            .await;
        assert!(matches!(result, Err(BerthError::EntryPoint(_))));
        assert_eq!(containers_left(&home), 0);
    }
}

#[tokio::test]
async fn test_entry_point_of_wrong_shape_rejected() {
    let (home, _project) = built_service().await;
    home.runtime
        .entry_points()
        .register("server:app", EntryTarget::Other { kind: "module" })
        .unwrap();

    let err = home
        .runtime
        .start("svc:1", &on_port(free_port()), ShutdownHandle::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        BerthError::EntryPoint(EntryPointError::InvalidShape { .. })
    ));
}

#[tokio::test]
async fn test_lifespan_failure_never_binds() {
    let (home, _project) = built_service().await;
    home.runtime
        .entry_points()
        .register("server:app", EntryTarget::application(FailingStartup))
        .unwrap();

    let port = free_port();
    let err = home
        .runtime
        .start("svc:1", &on_port(port), ShutdownHandle::new())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, BerthError::Startup(_)));
    assert!(err.to_string().contains("DATABASE_URL"));
    assert!(!wait_for_port(loopback(port), Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_environment_overrides_reach_the_application() {
    let project = ServiceProject::empty();
    project.write("server.py", "app = object()\n");
    project.write(
        "Berthfile",
        "FROM scratch\n\
         WORKDIR /app\n\
         COPY . .\n\
         ENV GREETING=hello\n\
         EXPOSE 8080\n\
         CMD [\"serve\", \"server:app\", \"--host\", \"0.0.0.0\", \"--port\", \"8080\"]\n",
    );
    let home = TestRuntime::new(Vec::new());
    home.runtime
        .build(project.path(), "env:1", &BuildOptions::default())
        .await
        .unwrap();
    home.runtime
        .entry_points()
        .register(
            "server:app",
            EntryTarget::application(EnvEcho {
                greeting: parking_lot::Mutex::new(String::new()),
            }),
        )
        .unwrap();

    let port = free_port();
    let mut options = on_port(port);
    options.env = vec![("GREETING".to_string(), "bonjour".to_string())];

    let shutdown = ShutdownHandle::new();
    let container = home
        .runtime
        .start("env:1", &options, shutdown.clone())
        .await
        .unwrap();

    let waiter = tokio::spawn(container.wait());

    let (_, body) = http_get(loopback(port), "/").await.unwrap();
    assert_eq!(body, "bonjour");

    shutdown.request();
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_image_is_not_found() {
    let home = TestRuntime::new(Vec::new());
    let err = home
        .runtime
        .start("missing:1", &LaunchOptions::default(), ShutdownHandle::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BerthError::NotFound(_)));
    assert!(!err.is_startup_failure());
}

#[tokio::test]
async fn test_undeclared_port_rejected() {
    let (home, _project) = built_service().await;
    let options = LaunchOptions {
        ports: vec!["9000:9000".parse().unwrap()],
        ..Default::default()
    };

    let err = home
        .runtime
        .start("svc:1", &options, ShutdownHandle::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BerthError::Config(_)));
}
