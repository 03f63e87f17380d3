//! Scenarios driving the publication actor over plain directories.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::fixtures::SIGNING_KEY;
use crate::{
    find_protection, load_directory_tree, template, BaseUrl, Error, Profiles, RevisionOracle,
    SigningKey, StaticOracle, System, SystemConfig, DIRECTORIES_FILE, STAMP_FILE,
};

/// A [StaticOracle] counting the revision lookups, which only happen when
/// a profile gets fingerprinted.
struct CountingOracle {
    inner: StaticOracle,
    lookups: AtomicUsize,
}

impl CountingOracle {
    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RevisionOracle for CountingOracle {
    async fn ensure_checkouts(&self, branches: &[String]) -> Result<(), Error> {
        self.inner.ensure_checkouts(branches).await
    }

    async fn current_revision(&self, branch: &str) -> Result<String, Error> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.current_revision(branch).await
    }

    async fn refresh(&self, branches: &[String]) -> Vec<String> {
        self.inner.refresh(branches).await
    }

    fn working_tree(&self, branch: &str) -> PathBuf {
        self.inner.working_tree(branch)
    }
}

struct Fixture {
    tmpdir: TempDir,
    oracle: Arc<CountingOracle>,
}

impl Fixture {
    fn web_root(&self) -> PathBuf {
        self.tmpdir.path().join("web")
    }

    fn result_root(&self) -> PathBuf {
        self.tmpdir.path().join("results")
    }

    fn alias(&self, profile: &str) -> PathBuf {
        self.web_root().join(profile)
    }

    fn published(&self, profile: &str) -> PathBuf {
        std::fs::read_link(self.alias(profile)).expect("profile must be published")
    }

    fn read(&self, profile: &str, path: &str) -> String {
        std::fs::read_to_string(self.alias(profile).join(path)).unwrap()
    }

    /// Sorted names in the result root.
    fn results(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.result_root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn config(&self) -> SystemConfig {
        SystemConfig {
            web_root: self.web_root(),
            result_root: self.result_root(),
            base_url: BaseUrl {
                template: "{protocol}://{host}:{port}/{profile}".into(),
                protocol: "https".into(),
                host: "localhost".into(),
                port: 8083,
            },
            update: Duration::from_secs(3600),
            lenient_templates: false,
        }
    }

    fn start(&self) -> Running {
        self.start_with(self.config())
    }

    fn start_with(&self, cfg: SystemConfig) -> Running {
        let key = Arc::new(SigningKey::parse(SIGNING_KEY, None).unwrap());
        let (system, actor) =
            System::new(cfg, profiles(), self.oracle.clone(), key.clone()).unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(actor.run(token.clone()));
        Running {
            system,
            key,
            token,
            handle,
        }
    }
}

struct Running {
    system: System,
    key: Arc<SigningKey>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.token.cancel();
        self.handle.await.unwrap();
    }
}

fn profiles() -> Profiles {
    toml::from_str(
        r##"
        "all-good" = ["main"]
        "alias-of-good" = ["#all-good"]
        "broken_filename" = ["main", "bad-filename-branch"]
        "reversed" = ["bad-filename-branch", "main"]
        "broken-template" = ["main", "broken"]
        "protected" = ["#all-good", "extra"]
        "##,
    )
    .unwrap()
}

fn write(root: &Path, branch: &str, path: &str, contents: &str) {
    let path = root.join(branch).join("www/html").join(path);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[fixture]
fn fixture() -> Fixture {
    let tmpdir = TempDir::new().unwrap();
    let branches = tmpdir.path().join("branches");

    write(&branches, "main", "index.html", "main");
    write(&branches, "main", ".well-known/csaf/white/2024/doc-1.json", "{\"id\": 1}\n");

    write(&branches, "bad-filename-branch", "index.html", "bad");
    write(
        &branches,
        "bad-filename-branch",
        ".well-known/csaf/provider-metadata.json",
        "{\"canonical_url\": \"$(( .CANONICAL_URL ))$\", \"key\": \"$(( .PUBLIC_OPENPGP_KEY_URL ))$\"}\n",
    );

    write(&branches, "broken", "bad.json", "{\"x\": \"$(( .NO_SUCH_PARAM ))$\"}");

    write(
        &branches,
        "extra",
        "protected/.directives.toml",
        "[protection]\nuser = \"alice\"\npassword = \"secret\"\n",
    );
    write(&branches, "extra", "protected/secret.json", "{}");

    let inner = StaticOracle::new(&branches);
    for branch in ["main", "bad-filename-branch", "broken", "extra"] {
        inner.set_revision(branch, "1");
    }

    Fixture {
        tmpdir,
        oracle: Arc::new(CountingOracle {
            inner,
            lookups: AtomicUsize::new(0),
        }),
    }
}

#[rstest]
#[tokio::test]
async fn serve_is_memoized(fixture: Fixture) {
    let running = fixture.start();

    running.system.serve("all-good").await.unwrap();
    let target = fixture.published("all-good");
    assert!(target.starts_with(fixture.result_root()));
    assert_eq!(1, fixture.oracle.lookups());

    let sidecar = target.join(".well-known/csaf/white/2024/doc-1.json.sha256");
    let modified = std::fs::metadata(&sidecar).unwrap().modified().unwrap();

    running.system.serve("all-good").await.unwrap();
    assert_eq!(target, fixture.published("all-good"));
    assert_eq!(1, fixture.oracle.lookups(), "second serve must not fingerprint");
    assert_eq!(
        modified,
        std::fs::metadata(&sidecar).unwrap().modified().unwrap()
    );

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn identical_content_is_deduplicated(fixture: Fixture) {
    let running = fixture.start();

    running.system.serve("all-good").await.unwrap();
    running.system.serve("alias-of-good").await.unwrap();

    assert_eq!(fixture.published("all-good"), fixture.published("alias-of-good"));
    assert_eq!(1, fixture.results().len());

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn unknown_profile(fixture: Fixture) {
    let running = fixture.start();

    assert!(matches!(
        running.system.serve("nope").await,
        Err(Error::ProfileNotFound(p)) if p == "nope"
    ));
    assert!(std::fs::read_dir(fixture.web_root()).unwrap().next().is_none());
    assert!(fixture.results().is_empty());
    assert_eq!(0, fixture.oracle.lookups());

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn broken_filename_overlays_main(fixture: Fixture) {
    let running = fixture.start();
    running.system.serve("broken_filename").await.unwrap();

    assert_eq!("bad", fixture.read("broken_filename", "index.html"));

    let key_id = running.key.key_id().to_string();
    assert_eq!(
        format!(
            "{{\"canonical_url\": \"https://localhost:8083/broken_filename/.well-known/csaf/provider-metadata.json\", \"key\": \"https://localhost:8083/broken_filename/{key_id}.asc\"}}\n"
        ),
        fixture.read("broken_filename", ".well-known/csaf/provider-metadata.json")
    );

    let root = fixture.alias("broken_filename");
    for ext in ["sha256", "sha512", "asc"] {
        assert!(
            !root
                .join(format!(".well-known/csaf/provider-metadata.json.{ext}"))
                .exists(),
            "provider metadata must not get a .{ext}"
        );
        assert!(
            root.join(format!(".well-known/csaf/white/2024/doc-1.json.{ext}"))
                .exists(),
            "documents must get a .{ext}"
        );
    }
    assert!(root.join(format!("{key_id}.asc")).exists());
    // no directives in these branches
    assert!(!root.join(DIRECTORIES_FILE).exists());

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn merge_order_decides(fixture: Fixture) {
    let running = fixture.start();
    running.system.serve("broken_filename").await.unwrap();
    running.system.serve("reversed").await.unwrap();

    assert_eq!("bad", fixture.read("broken_filename", "index.html"));
    assert_eq!("main", fixture.read("reversed", "index.html"));
    assert_ne!(fixture.published("broken_filename"), fixture.published("reversed"));

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn failed_materialization_leaves_no_residue(fixture: Fixture) {
    let running = fixture.start();

    match running.system.serve("broken-template").await {
        Err(Error::Template(_, template::Error::UnknownParam(name))) => {
            assert_eq!("NO_SUCH_PARAM", name)
        }
        other => panic!("expected template error, got {other:?}"),
    }
    assert!(!fixture.alias("broken-template").exists());
    assert!(fixture.results().is_empty(), "{:?}", fixture.results());

    // the actor keeps serving
    running.system.serve("all-good").await.unwrap();

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn refresh_invalidates_dependents(fixture: Fixture) {
    let running = fixture.start();
    for profile in ["all-good", "broken_filename", "protected"] {
        running.system.serve(profile).await.unwrap();
    }
    let protected = fixture.published("protected");
    let all_good = fixture.published("all-good");

    assert!(running.system.refresh().await.unwrap().is_empty());

    fixture.oracle.inner.set_revision("extra", "2");
    assert_eq!(vec!["protected"], running.system.refresh().await.unwrap());
    assert!(std::fs::symlink_metadata(fixture.alias("protected")).is_err());
    assert!(!protected.exists());
    assert_eq!(all_good, fixture.published("all-good"));

    running.system.serve("protected").await.unwrap();
    assert_ne!(protected, fixture.published("protected"));

    // main feeds every published profile, "reversed" was never published
    fixture.oracle.inner.set_revision("main", "2");
    assert_eq!(
        vec!["all-good", "broken_filename", "protected"],
        running.system.refresh().await.unwrap()
    );
    assert!(fixture.results().is_empty());

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn concurrent_serves_build_once(fixture: Fixture) {
    let running = fixture.start();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let system = running.system.clone();
            tokio::spawn(async move { system.serve("broken_filename").await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // one fingerprint over two branches
    assert_eq!(2, fixture.oracle.lookups());
    assert_eq!(1, fixture.results().len());

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn directives_protect_folders(fixture: Fixture) {
    let running = fixture.start();
    running.system.serve("protected").await.unwrap();

    let root = fixture.alias("protected");
    assert!(root.join("protected/secret.json").exists());
    assert!(!root.join("protected/.directives.toml").exists());
    assert!(!root.join(format!("{DIRECTORIES_FILE}.sha256")).exists());

    let tree = load_directory_tree(&root.join(DIRECTORIES_FILE))
        .await
        .unwrap();
    let protection = find_protection(tree.as_ref(), &["protected", "secret.json"]).unwrap();
    assert!(protection.validate("alice", "secret"));
    assert_eq!(None, find_protection(tree.as_ref(), &["index.html"]));

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn dangling_alias_is_rebuilt(fixture: Fixture) {
    let running = fixture.start();
    running.system.serve("all-good").await.unwrap();
    let target = fixture.published("all-good");

    std::fs::remove_dir_all(&target).unwrap();
    running.system.serve("all-good").await.unwrap();
    assert_eq!(target, fixture.published("all-good"));
    assert_eq!("main", fixture.read("all-good", "index.html"));

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn startup_sweeps_stale_state(fixture: Fixture) {
    let running = fixture.start();
    running.system.serve("all-good").await.unwrap();
    running.system.serve("reversed").await.unwrap();
    running.stop().await;

    let valid = fixture.published("all-good");
    let modified = std::fs::metadata(valid.join("index.html"))
        .unwrap()
        .modified()
        .unwrap();

    // "reversed" became stale while not running
    fixture.oracle.inner.set_revision("bad-filename-branch", "2");
    let reversed = fixture.published("reversed");

    let staging = fixture.result_root().join(".staging-leftover");
    std::fs::create_dir(&staging).unwrap();
    let orphan = fixture.result_root().join("a".repeat(64));
    std::fs::create_dir(&orphan).unwrap();
    std::os::unix::fs::symlink(&orphan, fixture.alias("removed-profile")).unwrap();
    let unrelated = fixture.result_root().join("keep-me");
    std::fs::create_dir(&unrelated).unwrap();

    let running = fixture.start();
    // commands are only processed after the sweep
    running.system.serve("all-good").await.unwrap();

    assert!(!staging.exists());
    assert!(!orphan.exists());
    assert!(std::fs::symlink_metadata(fixture.alias("removed-profile")).is_err());
    assert!(std::fs::symlink_metadata(fixture.alias("reversed")).is_err());
    assert!(!reversed.exists());
    assert!(unrelated.exists());

    assert_eq!(valid, fixture.published("all-good"));
    assert_eq!(
        modified,
        std::fs::metadata(valid.join("index.html"))
            .unwrap()
            .modified()
            .unwrap()
    );

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn restart_with_other_settings_rebuilds(fixture: Fixture) {
    let running = fixture.start();
    running.system.serve("broken_filename").await.unwrap();
    running.system.serve("all-good").await.unwrap();
    running.stop().await;
    let before = fixture.published("broken_filename");
    assert!(before.join(STAMP_FILE).exists());

    let mut cfg = fixture.config();
    cfg.base_url.host = "example.org".into();
    cfg.base_url.port = 9999;
    let running = fixture.start_with(cfg);
    running.system.serve("broken_filename").await.unwrap();

    let key_id = running.key.key_id().to_string();
    assert_eq!(
        format!(
            "{{\"canonical_url\": \"https://example.org:9999/broken_filename/.well-known/csaf/provider-metadata.json\", \"key\": \"https://example.org:9999/broken_filename/{key_id}.asc\"}}\n"
        ),
        fixture.read("broken_filename", ".well-known/csaf/provider-metadata.json")
    );
    // same revisions, so the same name, but rebuilt
    assert_eq!(before, fixture.published("broken_filename"));
    // swept at start-up, not yet served again
    assert!(std::fs::symlink_metadata(fixture.alias("all-good")).is_err());
    assert_eq!(1, fixture.results().len());

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn unstamped_directory_is_rebuilt(fixture: Fixture) {
    let running = fixture.start();
    running.system.serve("all-good").await.unwrap();
    let target = fixture.published("all-good");

    // an unaliased directory under the right name, but without a stamp
    std::fs::remove_file(fixture.alias("all-good")).unwrap();
    std::fs::remove_file(target.join(STAMP_FILE)).unwrap();
    std::fs::write(target.join("index.html"), "stale").unwrap();

    running.system.serve("all-good").await.unwrap();
    assert_eq!(target, fixture.published("all-good"));
    assert_eq!("main", fixture.read("all-good", "index.html"));
    assert!(target.join(STAMP_FILE).exists());

    running.stop().await;
}

#[rstest]
#[tokio::test]
async fn zero_update_interval_is_rejected(fixture: Fixture) {
    let mut cfg = fixture.config();
    cfg.update = Duration::ZERO;
    let key = Arc::new(SigningKey::parse(SIGNING_KEY, None).unwrap());

    assert!(matches!(
        System::new(cfg, profiles(), fixture.oracle.clone(), key),
        Err(Error::ZeroUpdateInterval)
    ));
}

#[rstest]
#[tokio::test]
async fn killed_actor_is_gone(fixture: Fixture) {
    let running = fixture.start();
    running.system.kill().await;
    running.handle.await.unwrap();

    assert!(matches!(
        running.system.serve("all-good").await,
        Err(Error::ActorGone)
    ));
    // unknown profiles are rejected without the actor
    assert!(matches!(
        running.system.serve("nope").await,
        Err(Error::ProfileNotFound(_))
    ));
}
