//! Integration tests for image builds: reproducibility, caching and failure
//! isolation.

use berth::{BerthError, BuildOptions, DependencyError};
use berth_test_utils::{PackageIndexFixture, ServiceProject, TestRuntime, WrittenIndex};

const REQUIREMENTS: &str = "starlette>=0.37\nuvicorn==0.29.0\n";

fn index() -> WrittenIndex {
    PackageIndexFixture::new()
        .package("starlette", "0.36.3", &["anyio>=3.4"])
        .package("starlette", "0.37.2", &["anyio>=3.4,<5"])
        .package("anyio", "4.3.0", &[])
        .package("anyio", "5.0.0", &[])
        .package("uvicorn", "0.29.0", &["h11>=0.8"])
        .package("h11", "0.14.0", &[])
        .write()
}

#[tokio::test]
async fn test_same_inputs_build_same_image() {
    let index = index();
    let project = ServiceProject::new(REQUIREMENTS);

    let first = TestRuntime::new(vec![index.path_buf()]);
    let second = TestRuntime::new(vec![index.path_buf()]);

    let a = first
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap();
    let b = second
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap();

    assert_eq!(a.image_id, b.image_id);
    assert_eq!(a.packages(), b.packages());

    let resolved: Vec<(&str, &str)> = a
        .packages()
        .iter()
        .map(|p| (p.name.as_str(), p.version.as_str()))
        .collect();
    assert_eq!(
        resolved,
        vec![
            ("anyio", "4.3.0"),
            ("h11", "0.14.0"),
            ("starlette", "0.37.2"),
            ("uvicorn", "0.29.0"),
        ]
    );
}

#[tokio::test]
async fn test_rebuild_is_fully_cached() {
    let index = index();
    let project = ServiceProject::new(REQUIREMENTS);
    let home = TestRuntime::new(vec![index.path_buf()]);

    let first = home
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap();
    assert!(first.steps.iter().all(|s| !s.cached));

    let second = home
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(first.image_id, second.image_id);
    assert!(
        second
            .steps
            .iter()
            .filter(|s| s.layer.is_some())
            .all(|s| s.cached)
    );
}

#[tokio::test]
async fn test_source_change_keeps_dependency_layer_cached() {
    let index = index();
    let project = ServiceProject::new(REQUIREMENTS);
    let home = TestRuntime::new(vec![index.path_buf()]);

    let first = home
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap();

    project.write("server.py", "app = object()  # changed\n");
    let second = home
        .runtime
        .build(project.path(), "svc:2", &BuildOptions::default())
        .await
        .unwrap();

    let install = second.step("INSTALL").unwrap();
    assert!(install.cached);
    assert_eq!(install.layer, first.step("INSTALL").unwrap().layer);

    let sources = second.step("COPY . .").unwrap();
    assert!(!sources.cached);
    assert_ne!(first.image_id, second.image_id);
    assert_eq!(first.packages(), second.packages());
}

#[tokio::test]
async fn test_concurrent_builds_on_one_home_both_succeed() {
    let index = index();
    let project = ServiceProject::new(REQUIREMENTS);
    let home = TestRuntime::new(vec![index.path_buf()]);
    let options = BuildOptions::default();

    let (a, b) = tokio::join!(
        home.runtime.build(project.path(), "svc:a", &options),
        home.runtime.build(project.path(), "svc:b", &options),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.image_id, b.image_id);
    assert_eq!(home.runtime.images().list().await.len(), 2);
}

#[tokio::test]
async fn test_manifest_change_reinstalls() {
    let index = index();
    let project = ServiceProject::new(REQUIREMENTS);
    let home = TestRuntime::new(vec![index.path_buf()]);

    home.runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap();

    project.write("requirements.txt", "starlette==0.36.3\n");
    let report = home
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap();

    assert!(!report.step("INSTALL").unwrap().cached);
    let starlette = report
        .packages()
        .iter()
        .find(|p| p.name == "starlette")
        .unwrap();
    assert_eq!(starlette.version, "0.36.3");
}

#[tokio::test]
async fn test_no_cache_rebuilds_every_layer() {
    let index = index();
    let project = ServiceProject::new(REQUIREMENTS);
    let home = TestRuntime::new(vec![index.path_buf()]);

    let first = home
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap();
    let options = BuildOptions {
        no_cache: true,
        ..Default::default()
    };
    let second = home
        .runtime
        .build(project.path(), "svc:1", &options)
        .await
        .unwrap();

    assert!(second.steps.iter().all(|s| !s.cached));
    assert_eq!(first.image_id, second.image_id);
}

#[tokio::test]
async fn test_integrity_failure_tags_nothing() {
    let index = PackageIndexFixture::new()
        .package("starlette", "0.37.2", &[])
        .corrupt("starlette", "0.37.2")
        .write();
    let project = ServiceProject::new("starlette\n");
    let home = TestRuntime::new(vec![index.path_buf()]);

    let err = home
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BerthError::Dependency(DependencyError::Integrity { .. })
    ));
    assert!(home.runtime.images().list().await.is_empty());
}

#[tokio::test]
async fn test_unresolvable_requirement_fails_build() {
    let index = index();
    let project = ServiceProject::new("starlette>=1.0\n");
    let home = TestRuntime::new(vec![index.path_buf()]);

    let err = home
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BerthError::Dependency(DependencyError::Unresolvable { .. })
    ));
}

#[tokio::test]
async fn test_untrusted_index_rejected() {
    let trusted = index();
    let other = index();
    let project = ServiceProject::empty();
    project.write("requirements.txt", "anyio\n");
    project.write(
        "Berthfile",
        &format!(
            "FROM scratch\nWORKDIR /app\nINSTALL --index {} requirements.txt\n",
            other.path().display()
        ),
    );
    let home = TestRuntime::new(vec![trusted.path_buf()]);

    let err = home
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BerthError::Dependency(DependencyError::UntrustedSource(_))
    ));
}

#[tokio::test]
async fn test_unpinned_base_rejected_before_building() {
    let project = ServiceProject::empty();
    project.write("Berthfile", "FROM python\nWORKDIR /app\n");
    let home = TestRuntime::new(Vec::new());

    let err = home
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BerthError::Recipe(_)));
}

#[tokio::test]
async fn test_missing_copy_source_fails() {
    let project = ServiceProject::empty();
    project.write("Berthfile", "FROM scratch\nCOPY missing.txt /app/\n");
    let home = TestRuntime::new(Vec::new());

    let err = home
        .runtime
        .build(project.path(), "svc:1", &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BerthError::NotFound(_)));
    assert!(home.runtime.images().list().await.is_empty());
}
