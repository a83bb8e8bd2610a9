use crate::configs::{GlobalConfiguration, LocationConfiguration};
use crate::entities::LocationUrl;
use crate::error::{BackupError, Result};
use crate::jobs::Job;
use crate::retention::RetentionExpression;
use crate::shell::Shell;
use chrono::{DateTime, Duration, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// In-memory stand-in for the system shell, interpreting the exact command
/// lines the locations emit against a small filesystem model. All tests in
/// this module drive entire job lifecycles without touching a real
/// filesystem or process.
struct FakeShell {
    state: RefCell<State>,
}

#[derive(Default)]
struct State {
    /// subvolume path (no trailing separator) -> id
    subvolumes: BTreeMap<String, u64>,
    files: BTreeMap<String, Vec<u8>>,
    next_id: u64,
    /// parent snapshot name per performed transfer, `None` for full sends
    transfers: Vec<Option<String>>,
    fail_transfer: bool,
    /// fail any `mv` whose destination starts with this prefix
    fail_move_to: Option<String>,
}

static CREATE_CONTAINER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^if \[ ! -d "([^"]+)" \] ; then btrfs sub create "[^"]+"; fi$"#).unwrap()
});
static SHOW: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^btrfs sub show "([^"]+)"$"#).unwrap());
static SWEEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^for t in "([^"]+)"\.temp\.\* ; do if \[ -d "\$t" \] ; then btrfs sub del "\$t"; fi; done$"#)
        .unwrap()
});
static LIST: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^btrfs sub list -o "([^"]+)"$"#).unwrap());
static SNAP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^touch "([^"]+)" && btrfs sub snap -r "([^"]+)" "([^"]+)" && sync$"#).unwrap()
});
static MOVE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^mv "([^"]+)" "([^"]+)"$"#).unwrap());
static GUARDED_DEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^if \[ -d "([^"]+)" \] ; then btrfs sub del "[^"]+"; fi$"#).unwrap()
});
static BATCH_DEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^cd "([^"]+)" && btrfs sub del (.+)$"#).unwrap());
static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]+)""#).unwrap());
static RM: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^rm "([^"]+)"$"#).unwrap());
static CAT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^cat "([^"]+)"$"#).unwrap());
static PROBE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^if \[ -f "([^"]+)" \] ; then exit 10; fi$"#).unwrap());
static CAT_WRITE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^cat > "([^"]+)"$"#).unwrap());
static SEND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^btrfs send (?:-p "([^"]+)" )?"([^"]+)"$"#).unwrap());
static RECEIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^btrfs receive "([^"]+)"$"#).unwrap());

fn trim(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

fn basename(path: &str) -> String {
    let trimmed = trim(path);
    match trimmed.rfind('/') {
        Some(i) => trimmed[i + 1..].to_string(),
        None => trimmed,
    }
}

fn command_failed(stderr: &str) -> BackupError {
    BackupError::CommandFailed {
        code: 1,
        stderr: stderr.into(),
    }
}

impl State {
    fn create_subvolume(&mut self, path: &str) -> Result<()> {
        let key = trim(path);

        if self.subvolumes.contains_key(&key) {
            return Err(command_failed(&format!("target path already exists: {}", key)));
        }

        self.next_id += 1;
        self.subvolumes.insert(key, 255 + self.next_id);
        Ok(())
    }

    fn children(&self, container: &str) -> Vec<(u64, String)> {
        let prefix = format!("{}/", trim(container));

        self.subvolumes
            .iter()
            .filter(|(path, _)| {
                path.starts_with(&prefix) && !path[prefix.len()..].contains('/')
            })
            .map(|(path, id)| (*id, path.trim_start_matches('/').to_string()))
            .collect()
    }
}

impl FakeShell {
    fn new() -> FakeShell {
        FakeShell {
            state: RefCell::new(State::default()),
        }
    }

    fn seed_subvolume(&self, path: &str) {
        self.state
            .borrow_mut()
            .create_subvolume(path)
            .expect("seeding duplicate subvolume");
    }

    fn subvolume_exists(&self, path: &str) -> bool {
        self.state.borrow().subvolumes.contains_key(&trim(path))
    }

    /// Snapshot names below a container, oldest first.
    fn snapshot_names(&self, container: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .borrow()
            .children(container)
            .iter()
            .map(|(_, path)| basename(path))
            .filter(|name| name.starts_with("sx-"))
            .collect();
        names.sort();
        names
    }

    fn temp_count(&self, container: &str) -> usize {
        self.state
            .borrow()
            .children(container)
            .iter()
            .filter(|(_, path)| basename(path).starts_with(".temp."))
            .count()
    }

    fn file(&self, path: &str) -> Option<String> {
        self.state
            .borrow()
            .files
            .get(path)
            .map(|content| String::from_utf8_lossy(content).into_owned())
    }

    fn transfer_parents(&self) -> Vec<Option<String>> {
        self.state.borrow().transfers.clone()
    }

    fn set_fail_transfer(&self, fail: bool) {
        self.state.borrow_mut().fail_transfer = fail;
    }

    fn set_fail_move_to(&self, prefix: Option<&str>) {
        self.state.borrow_mut().fail_move_to = prefix.map(|p| p.to_string());
    }
}

impl Shell for FakeShell {
    fn exec_check_output(&self, cmd: &str, _url: &LocationUrl) -> Result<Vec<u8>> {
        let mut state = self.state.borrow_mut();

        if let Some(captures) = CREATE_CONTAINER.captures(cmd) {
            if !state.subvolumes.contains_key(&trim(&captures[1])) {
                state.create_subvolume(&captures[1])?;
            }
            return Ok(Vec::new());
        }

        if let Some(captures) = SHOW.captures(cmd) {
            return match state.subvolumes.contains_key(&trim(&captures[1])) {
                true => Ok(Vec::new()),
                false => Err(command_failed("not a btrfs subvolume")),
            };
        }

        if let Some(captures) = SWEEP.captures(cmd) {
            let prefix = format!("{}.temp.", &captures[1]);
            let leftovers: Vec<String> = state
                .subvolumes
                .keys()
                .filter(|path| path.starts_with(&prefix))
                .cloned()
                .collect();
            for path in leftovers {
                state.subvolumes.remove(&path);
            }
            return Ok(Vec::new());
        }

        if let Some(captures) = LIST.captures(cmd) {
            let mut lines = String::new();
            for (id, path) in state.children(&captures[1]) {
                lines.push_str(&format!("ID {0} gen {0} top level 5 path {1}\n", id, path));
            }
            return Ok(lines.into_bytes());
        }

        if let Some(captures) = SNAP.captures(cmd) {
            state.create_subvolume(&captures[3])?;
            return Ok(Vec::new());
        }

        if let Some(captures) = MOVE.captures(cmd) {
            let (source, dest) = (trim(&captures[1]), trim(&captures[2]));

            if let Some(prefix) = &state.fail_move_to {
                if dest.starts_with(prefix.as_str()) {
                    return Err(command_failed("mv: permission denied"));
                }
            }

            match state.subvolumes.remove(&source) {
                Some(id) => {
                    state.subvolumes.insert(dest, id);
                    return Ok(Vec::new());
                }
                None => return Err(command_failed("mv: no such file or directory")),
            }
        }

        if let Some(captures) = GUARDED_DEL.captures(cmd) {
            state.subvolumes.remove(&trim(&captures[1]));
            return Ok(Vec::new());
        }

        if let Some(captures) = BATCH_DEL.captures(cmd) {
            let container = captures[1].to_string();
            for name in QUOTED.captures_iter(&captures[2].to_string()) {
                let path = trim(&format!("{}{}", container, &name[1]));
                if state.subvolumes.remove(&path).is_none() {
                    return Err(command_failed(&format!("no such subvolume: {}", path)));
                }
            }
            return Ok(Vec::new());
        }

        if let Some(captures) = RM.captures(cmd) {
            return match state.files.remove(&captures[1].to_string()) {
                Some(_) => Ok(Vec::new()),
                None => Err(command_failed("rm: no such file or directory")),
            };
        }

        if let Some(captures) = CAT.captures(cmd) {
            return match state.files.get(&captures[1].to_string()) {
                Some(content) => Ok(content.clone()),
                None => Err(command_failed("cat: no such file or directory")),
            };
        }

        Err(command_failed(&format!("unhandled command [{}]", cmd)))
    }

    fn exec_call(&self, cmd: &str, _url: &LocationUrl) -> Result<i32> {
        let state = self.state.borrow();

        if let Some(captures) = PROBE.captures(cmd) {
            return match state.files.contains_key(&captures[1].to_string()) {
                true => Ok(10),
                false => Ok(0),
            };
        }

        Err(command_failed(&format!("unhandled command [{}]", cmd)))
    }

    fn exec_write(&self, cmd: &str, _url: &LocationUrl, input: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();

        if let Some(captures) = CAT_WRITE.captures(cmd) {
            state.files.insert(captures[1].to_string(), input.to_vec());
            return Ok(());
        }

        Err(command_failed(&format!("unhandled command [{}]", cmd)))
    }

    fn exists(&self, _command: &str, _url: &LocationUrl) -> bool {
        false
    }

    fn transfer(
        &self,
        send_cmd: &str,
        _send_url: &LocationUrl,
        receive_cmd: &str,
        _receive_url: &LocationUrl,
        _progress: bool,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();

        let send = SEND
            .captures(send_cmd)
            .ok_or_else(|| command_failed(&format!("unhandled send command [{}]", send_cmd)))?;
        let receive = RECEIVE.captures(receive_cmd).ok_or_else(|| {
            command_failed(&format!("unhandled receive command [{}]", receive_cmd))
        })?;

        let container = receive[1].to_string();
        let send_path = send[2].to_string();
        let parent = send.get(1).map(|m| m.as_str().to_string());

        if state.fail_transfer {
            // a broken pipe still leaves a partial subvolume behind
            let _ = state.create_subvolume(&format!("{}{}", container, basename(&send_path)));
            return Err(BackupError::TransferFailed {
                send: 1,
                receive: 1,
            });
        }

        if !state.subvolumes.contains_key(&trim(&send_path)) {
            return Err(command_failed("cannot send: no such subvolume"));
        }

        if let Some(parent) = &parent {
            if !state.subvolumes.contains_key(&trim(parent)) {
                return Err(command_failed("cannot send: parent subvolume missing"));
            }

            let parent_on_dest = format!("{}{}", container, basename(parent));
            if !state.subvolumes.contains_key(&trim(&parent_on_dest)) {
                return Err(command_failed("cannot receive: parent snapshot unknown"));
            }
        }

        state.create_subvolume(&format!("{}{}", container, basename(&send_path)))?;
        state.transfers.push(parent.map(|p| basename(&p)));

        Ok(())
    }
}

fn url(text: &str) -> LocationUrl {
    LocationUrl::parse(text).unwrap()
}

fn retention(text: &str) -> RetentionExpression {
    RetentionExpression::from_str(text).unwrap()
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2015, 1, 2, 13, 0, 0).unwrap()
}

fn snapshot_name_at(now: DateTime<Utc>) -> String {
    crate::entities::SnapshotName::new(now).to_string()
}

fn setup() -> (Arc<FakeShell>, Arc<dyn Shell>) {
    let shell = Arc::new(FakeShell::new());
    shell.seed_subvolume("/mnt/a");
    shell.seed_subvolume("/mnt/b");
    let dyn_shell: Arc<dyn Shell> = shell.clone();
    (shell, dyn_shell)
}

fn init_job(shell: &Arc<dyn Shell>) -> Job {
    Job::init(
        shell.clone(),
        url("/mnt/a"),
        Some(url("/mnt/b")),
        Some(retention("3")),
        Some(retention("3")),
        false,
        &GlobalConfiguration::default(),
    )
    .unwrap()
}

#[test]
fn init_writes_matching_configurations() {
    let (fake, shell) = setup();

    let job = init_job(&shell);
    assert!(job.source().uuid().is_some());

    let source_config =
        LocationConfiguration::read(&fake.file("/mnt/a/.sxbackup/.btrfs-sxbackup").unwrap())
            .unwrap();
    let dest_config =
        LocationConfiguration::read(&fake.file("/mnt/b/.btrfs-sxbackup").unwrap()).unwrap();

    assert_eq!(source_config.uuid, dest_config.uuid);
    assert_eq!(source_config.uuid, job.source().uuid());
    assert_eq!(
        source_config.destination.as_ref().map(|u| u.path.as_str()),
        Some("/mnt/b/")
    );
    assert_eq!(
        dest_config.source.as_ref().map(|u| u.path.as_str()),
        Some("/mnt/a/")
    );
    assert_eq!(dest_config.source_container.as_deref(), Some(".sxbackup"));
}

#[test]
fn init_refuses_initialized_locations() {
    let (_, shell) = setup();

    init_job(&shell);

    let result = Job::init(
        shell.clone(),
        url("/mnt/a"),
        Some(url("/mnt/b")),
        None,
        None,
        false,
        &GlobalConfiguration::default(),
    );

    assert!(matches!(result, Err(BackupError::AlreadyInitialized(_))));
}

#[test]
fn load_from_either_side_yields_the_same_job() {
    let (_, shell) = setup();

    let job = init_job(&shell);
    let uuid = job.source().uuid();

    let from_source = Job::load(shell.clone(), url("/mnt/a")).unwrap();
    let from_dest = Job::load(shell.clone(), url("/mnt/b")).unwrap();

    for loaded in [&from_source, &from_dest] {
        assert_eq!(loaded.source().url().path, "/mnt/a/");
        assert_eq!(loaded.source().uuid(), uuid);
        assert_eq!(loaded.destination().unwrap().url().path, "/mnt/b/");
        assert_eq!(loaded.destination().unwrap().uuid(), uuid);
    }
}

#[test]
fn load_uninitialized_location_fails() {
    let (_, shell) = setup();

    assert!(matches!(
        Job::load(shell.clone(), url("/mnt/a")),
        Err(BackupError::NotInitialized(_))
    ));
}

#[test]
fn run_cycle_transfers_incrementally_and_applies_retention() {
    let (fake, shell) = setup();

    init_job(&shell);
    let mut job = Job::load(shell.clone(), url("/mnt/a")).unwrap();

    for i in 0..3 {
        job.run_at(t0() + Duration::hours(i)).unwrap();
    }

    let expected: Vec<String> = (0..3)
        .map(|i| snapshot_name_at(t0() + Duration::hours(i)))
        .collect();
    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup"), expected);
    assert_eq!(fake.snapshot_names("/mnt/b"), expected);

    // first transfer is full, later ones use the matching heads as parent
    assert_eq!(
        fake.transfer_parents(),
        vec![
            None,
            Some(snapshot_name_at(t0())),
            Some(snapshot_name_at(t0() + Duration::hours(1))),
        ]
    );

    // a fourth run fills the retention window of three past snapshots
    job.run_at(t0() + Duration::hours(3)).unwrap();
    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 4);
    assert_eq!(fake.snapshot_names("/mnt/b").len(), 4);

    // the fifth run ages the oldest snapshot out on both sides
    job.run_at(t0() + Duration::hours(4)).unwrap();
    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 4);
    assert_eq!(fake.snapshot_names("/mnt/b").len(), 4);
    assert!(!fake
        .snapshot_names("/mnt/a/.sxbackup")
        .contains(&snapshot_name_at(t0())));
    assert!(!fake.snapshot_names("/mnt/b").contains(&snapshot_name_at(t0())));

    assert_eq!(fake.temp_count("/mnt/a/.sxbackup"), 0);
    assert_eq!(fake.temp_count("/mnt/b"), 0);
}

#[test]
fn run_with_backwards_clock_fails_without_side_effects() {
    let (fake, shell) = setup();

    init_job(&shell);
    let mut job = Job::load(shell.clone(), url("/mnt/a")).unwrap();

    job.run_at(t0()).unwrap();

    let result = job.run_at(t0());
    assert!(matches!(result, Err(BackupError::ClockSkew { .. })));

    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 1);
    assert_eq!(fake.snapshot_names("/mnt/b").len(), 1);
    assert_eq!(fake.temp_count("/mnt/a/.sxbackup"), 0);
    assert_eq!(fake.temp_count("/mnt/b"), 0);
}

#[test]
fn failed_transfer_leaves_no_scratch_subvolumes() {
    let (fake, shell) = setup();

    init_job(&shell);
    let mut job = Job::load(shell.clone(), url("/mnt/a")).unwrap();

    job.run_at(t0()).unwrap();

    fake.set_fail_transfer(true);
    let result = job.run_at(t0() + Duration::hours(1));
    assert!(matches!(result, Err(BackupError::TransferFailed { .. })));

    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 1);
    assert_eq!(fake.snapshot_names("/mnt/b").len(), 1);
    assert_eq!(fake.temp_count("/mnt/a/.sxbackup"), 0);
    assert_eq!(fake.temp_count("/mnt/b"), 0);

    // the next run recovers on its own
    fake.set_fail_transfer(false);
    job.run_at(t0() + Duration::hours(2)).unwrap();
    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 2);
    assert_eq!(fake.snapshot_names("/mnt/b").len(), 2);
}

#[test]
fn failed_destination_promotion_keeps_sides_consistent() {
    let (fake, shell) = setup();

    init_job(&shell);
    let mut job = Job::load(shell.clone(), url("/mnt/a")).unwrap();

    job.run_at(t0()).unwrap();

    fake.set_fail_move_to(Some("/mnt/b/sx-"));
    let result = job.run_at(t0() + Duration::hours(1));
    assert!(result.is_err());

    // neither side holds the new snapshot or any scratch subvolume
    let new_name = snapshot_name_at(t0() + Duration::hours(1));
    assert!(!fake.snapshot_names("/mnt/a/.sxbackup").contains(&new_name));
    assert!(!fake.snapshot_names("/mnt/b").contains(&new_name));
    assert_eq!(fake.temp_count("/mnt/a/.sxbackup"), 0);
    assert_eq!(fake.temp_count("/mnt/b"), 0);

    fake.set_fail_move_to(None);
    job.run_at(t0() + Duration::hours(2)).unwrap();
    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 2);
    assert_eq!(fake.snapshot_names("/mnt/b").len(), 2);
}

#[test]
fn source_only_job_rotates_snapshots() {
    let (fake, shell) = setup();

    Job::init(
        shell.clone(),
        url("/mnt/a"),
        None,
        Some(retention("2")),
        None,
        false,
        &GlobalConfiguration::default(),
    )
    .unwrap();

    let mut job = Job::load(shell.clone(), url("/mnt/a")).unwrap();
    assert!(job.destination().is_none());

    for i in 0..3 {
        job.run_at(t0() + Duration::hours(i)).unwrap();
    }
    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 3);

    job.run_at(t0() + Duration::hours(3)).unwrap();
    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 3);
    assert!(!fake
        .snapshot_names("/mnt/a/.sxbackup")
        .contains(&snapshot_name_at(t0())));
}

#[test]
fn purge_with_override_thins_both_sides() {
    let (fake, shell) = setup();

    init_job(&shell);
    let mut job = Job::load(shell.clone(), url("/mnt/a")).unwrap();

    for i in 0..4 {
        job.run_at(t0() + Duration::hours(i)).unwrap();
    }
    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 4);

    job.purge_at(
        t0() + Duration::hours(4),
        Some(&retention("1")),
        Some(&retention("1")),
    )
    .unwrap();

    // the head plus one retained snapshot survive on each side
    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 2);
    assert_eq!(fake.snapshot_names("/mnt/b").len(), 2);
}

#[test]
fn update_rewrites_configurations() {
    let (fake, shell) = setup();

    init_job(&shell);
    let mut job = Job::load(shell.clone(), url("/mnt/a")).unwrap();

    job.update(Some(retention("5")), None, Some(true)).unwrap();

    let source_config = fake.file("/mnt/a/.sxbackup/.btrfs-sxbackup").unwrap();
    assert!(source_config.contains("retention = 5\n"));
    assert!(source_config.contains("compress = True\n"));

    let dest_config = fake.file("/mnt/b/.btrfs-sxbackup").unwrap();
    assert!(dest_config.contains("retention = 3\n"));
    assert!(dest_config.contains("compress = True\n"));
}

#[test]
fn destroy_with_purge_removes_everything() {
    let (fake, shell) = setup();

    init_job(&shell);
    let mut job = Job::load(shell.clone(), url("/mnt/a")).unwrap();

    job.run_at(t0()).unwrap();
    job.run_at(t0() + Duration::hours(1)).unwrap();

    job.destroy(true).unwrap();

    assert!(fake.snapshot_names("/mnt/b").is_empty());
    assert!(!fake.subvolume_exists("/mnt/a/.sxbackup"));
    assert!(fake.file("/mnt/a/.sxbackup/.btrfs-sxbackup").is_none());
    assert!(fake.file("/mnt/b/.btrfs-sxbackup").is_none());
}

#[test]
fn transfer_performs_a_one_shot_copy() {
    let (fake, shell) = setup();

    let name = Job::transfer_at(shell.clone(), url("/mnt/a"), url("/mnt/b"), false, t0()).unwrap();

    assert_eq!(name.to_string(), snapshot_name_at(t0()));
    assert_eq!(fake.snapshot_names("/mnt/a/.sxbackup").len(), 1);
    assert_eq!(fake.snapshot_names("/mnt/b").len(), 1);
    assert_eq!(fake.temp_count("/mnt/a/.sxbackup"), 0);
    assert_eq!(fake.temp_count("/mnt/b"), 0);
}

#[test]
fn info_renders_both_sides() {
    let (_, shell) = setup();

    init_job(&shell);
    let mut job = Job::load(shell.clone(), url("/mnt/a")).unwrap();
    job.run_at(t0()).unwrap();

    let mut out: Vec<u8> = Vec::new();
    job.print_info(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();

    assert!(out.contains("UUID"));
    assert!(out.contains("Source URL"));
    assert!(out.contains("/mnt/a"));
    assert!(out.contains("Destination URL"));
    assert!(out.contains(&snapshot_name_at(t0())));
}
