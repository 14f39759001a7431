//! Auto-deploy module.
//!
//! For every service with a `[service.git]` table, detection reads the
//! working copy's remote and branch at startup. From then on the module
//! listens for push events on the bus: a push for the watched
//! repository and branch pulls the working copy through the privileged
//! helper and, when enabled, restarts the service's systemd unit.

use crate::bus::{BusEvent, BusListener, Emission, Logger, PushEvent};
use crate::instance::{GitState, Instance, ServiceRun};
use crate::modules::{LifecycleEvent, LifecycleHandler, Module};
use crate::root::CommandRunner;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

struct GitCtx {
    instance: Arc<Instance>,
    logger: Logger,
}

pub struct GitModule {
    state: OnceLock<GitCtx>,
}

impl GitModule {
    pub fn new() -> Self {
        Self {
            state: OnceLock::new(),
        }
    }

    async fn configure(&self, ctx: &GitCtx, service: &Arc<ServiceRun>) {
        match detect(ctx, service).await {
            Ok(state) => {
                ctx.logger
                    .info(format!(
                        "Watching {}/{} for {}",
                        state.repo,
                        state.branch,
                        service.name()
                    ))
                    .await;
                if let Some(cfg) = service.config.git.as_ref() {
                    if let Some(repo) = cfg.repo.as_deref() {
                        if repo != state.repo {
                            ctx.logger
                                .warn(format!(
                                    "Overriding detected repo {} with {repo}",
                                    state.repo
                                ))
                                .await;
                        }
                    }
                    if let Some(branch) = cfg.branch.as_deref() {
                        if branch != state.branch {
                            ctx.logger
                                .warn(format!(
                                    "Overriding detected branch {} with {branch}",
                                    state.branch
                                ))
                                .await;
                        }
                    }
                }
                *service.git.lock().await = Some(state);
            }
            Err(err) => {
                ctx.logger
                    .error(format!(
                        "Could not determine repository info for {}: {err:#}",
                        service.name()
                    ))
                    .await;
            }
        }
    }

    async fn handle_push(&self, ctx: &GitCtx, service: &Arc<ServiceRun>, push: &PushEvent) {
        let Some(cfg) = service.config.git.as_ref() else {
            return;
        };
        let detected = service.git.lock().await.clone();
        let Some(detected) = detected else {
            // Detection failed at startup; the service is not watched.
            return;
        };
        let repo = cfg.repo.as_deref().unwrap_or(&detected.repo);
        let branch = cfg.branch.as_deref().unwrap_or(&detected.branch);
        if push.repo != repo || push.git_ref != format!("refs/heads/{branch}") {
            return;
        }

        ctx.logger
            .debug(format!(
                "Push matches {} ({repo} {})",
                service.name(),
                push.git_ref
            ))
            .await;
        if !cfg.pull {
            return;
        }
        if self.exec_pull(ctx, service, repo).await && cfg.restart {
            self.exec_restart(ctx, service).await;
        }
    }

    /// Pulls the working copy through the helper. Returns whether the
    /// pull succeeded; the restart is gated on that.
    async fn exec_pull(&self, ctx: &GitCtx, service: &Arc<ServiceRun>, repo: &str) -> bool {
        let Some(root) = ctx.instance.root() else {
            ctx.logger
                .error(format!("Cannot pull {}: helper unavailable", service.name()))
                .await;
            return false;
        };
        let Some(path) = service.config.path.clone() else {
            return false;
        };
        let dir = path.to_string_lossy().into_owned();
        match root.exec("git", &["-C", &dir, "pull"], None).await {
            Ok(out) => {
                let text = if out.stderr.trim().is_empty() {
                    out.stdout
                } else {
                    out.stderr
                };
                ctx.logger
                    .info(format!(
                        "Pulling repository {repo} @{}\n{}",
                        ctx.instance.host.hostname,
                        trimmed_lines(&text)
                    ))
                    .await;
                true
            }
            Err(err) => {
                ctx.logger
                    .error(format!("Pull failed for {}: {err}", service.name()))
                    .await;
                false
            }
        }
    }

    async fn exec_restart(&self, ctx: &GitCtx, service: &Arc<ServiceRun>) {
        let name = service.name();
        let Some(root) = ctx.instance.root() else {
            ctx.logger
                .error(format!("Cannot restart {name}: helper unavailable"))
                .await;
            return;
        };
        if let Err(err) = root.exec("systemctl", &["restart", name], None).await {
            ctx.logger
                .error(format!("Restart failed for {name}: {err}"))
                .await;
            return;
        }
        match root.exec("systemctl", &["status", name, "-n3"], None).await {
            Ok(out) => {
                ctx.logger
                    .info(format!(
                        "Restarting service {name} @{}\n{}",
                        ctx.instance.host.hostname,
                        status_excerpt(&out.stdout)
                    ))
                    .await;
            }
            Err(err) => {
                ctx.logger
                    .error(format!("Status query failed for {name}: {err}"))
                    .await;
            }
        }
    }
}

impl Default for GitModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for GitModule {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn init(self: Arc<Self>, instance: &Arc<Instance>) -> Result<bool> {
        let logger = instance.bus.logger("Git");
        let load = instance
            .services
            .iter()
            .any(|service| service.config.git.is_some());
        logger.debug(format!("Init (load: {load})")).await;
        if !load {
            return Ok(false);
        }
        let _ = self.state.set(GitCtx {
            instance: instance.clone(),
            logger: logger.clone(),
        });
        logger.listen(self.clone() as Arc<dyn BusListener>).await;
        Ok(true)
    }

    fn lifecycle(self: Arc<Self>) -> Option<Arc<dyn LifecycleHandler>> {
        Some(self)
    }
}

#[async_trait]
impl LifecycleHandler for GitModule {
    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        let Some(ctx) = self.state.get() else {
            return Ok(());
        };
        if let LifecycleEvent::Start(service) = event {
            if service.config.git.is_some() {
                self.configure(ctx, service).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BusListener for GitModule {
    async fn on_emission(&self, _source: &str, emission: &Emission) {
        let Emission::Event(BusEvent::GitPush(push)) = emission else {
            return;
        };
        let Some(ctx) = self.state.get() else {
            return;
        };
        for service in &ctx.instance.services {
            if service.config.git.is_some() {
                self.handle_push(ctx, service, push).await;
            }
        }
    }
}

async fn detect(ctx: &GitCtx, service: &Arc<ServiceRun>) -> Result<GitState> {
    let path = service
        .config
        .path
        .as_ref()
        .context("service has no working copy path")?;
    let dir = path.to_string_lossy().into_owned();
    let local = ctx.instance.local();

    let remote = run_git(local.as_ref(), &dir, &["config", "--get", "remote.origin.url"]).await?;
    let repo = repo_from_remote_url(&remote)?;
    let branch = run_git(local.as_ref(), &dir, &["branch", "--show-current"]).await?;
    let branch = branch.trim().to_string();
    if branch.is_empty() {
        bail!("working copy has no current branch");
    }
    Ok(GitState { repo, branch })
}

/// Detection treats anything on stderr as a failure even when git
/// exits 0, matching how flaky partial clones misbehave.
async fn run_git(runner: &dyn CommandRunner, dir: &str, args: &[&str]) -> Result<String> {
    let mut full = vec!["-C", dir];
    full.extend_from_slice(args);
    let out = runner
        .exec("git", &full, None)
        .await
        .map_err(|err| anyhow!("git {}: {err}", args.join(" ")))?;
    if !out.stderr.trim().is_empty() {
        bail!("git {} reported: {}", args.join(" "), out.stderr.trim());
    }
    Ok(out.stdout)
}

/// Owner/name from a remote URL, https or ssh form, without any `.git`
/// suffix. Falls back to the bare name when no owner segment exists.
fn repo_from_remote_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let mut tail = trimmed.rsplit(['/', ':']);
    let name = tail
        .next()
        .filter(|segment| !segment.is_empty())
        .context("empty remote url")?;
    let name = name.strip_suffix(".git").unwrap_or(name);
    let owner = tail
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains('@') && !segment.contains('.'));
    match owner {
        Some(owner) => Ok(format!("{owner}/{name}")),
        None => Ok(name.to_string()),
    }
}

fn trimmed_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| line.len() > 1)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compact `systemctl status` excerpt: the `Active:` line up to its
/// " since " clause, then the trailing journal lines with their
/// timestamp/unit prefix removed.
fn status_excerpt(stdout: &str) -> String {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.len() > 1)
        .collect();

    let mut out: Vec<String> = Vec::new();
    if let Some(active) = lines.iter().find(|line| line.starts_with("Active:")) {
        out.push(active.split(" since ").next().unwrap_or(active).to_string());
    }

    let mut journal: Vec<String> = lines
        .iter()
        .rev()
        .take_while(|line| looks_like_journal(line))
        .map(|line| strip_journal_prefix(line))
        .collect();
    journal.reverse();
    out.extend(journal);
    out.join("\n")
}

fn looks_like_journal(line: &str) -> bool {
    matches!(line.split_whitespace().next(), Some(token) if MONTHS.contains(&token))
}

fn strip_journal_prefix(line: &str) -> String {
    match line.split_once(": ") {
        Some((_, message)) => message.to_string(),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::root::{ExecError, ExecOutput};
    use std::path::Path;
    use tokio::sync::Mutex;

    const STATUS_OUTPUT: &str = "\
● api.service - Acme API
     Loaded: loaded (/etc/systemd/system/api.service; enabled; preset: enabled)
     Active: active (running) since Sun 2026-08-23 10:41:58 UTC; 2s ago
   Main PID: 4242 (api)
      Tasks: 9 (limit: 18937)
     Memory: 24.1M
        CPU: 212ms
     CGroup: /system.slice/api.service
             └─4242 /srv/api/bin/api

Aug 23 10:41:58 buoy systemd[1]: Started api.service - Acme API.
Aug 23 10:41:59 buoy api[4242]: listening on /run/api.sock
Aug 23 10:41:59 buoy api[4242]: ready
";

    struct StubRoot {
        calls: Mutex<Vec<String>>,
        fail_cmd: Option<&'static str>,
    }

    impl StubRoot {
        fn new(fail_cmd: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_cmd,
            })
        }

        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl CommandRunner for StubRoot {
        async fn exec(
            &self,
            cmd: &str,
            args: &[&str],
            _cwd: Option<&Path>,
        ) -> Result<ExecOutput, ExecError> {
            let call = format!("{cmd} {}", args.join(" "));
            self.calls.lock().await.push(call);
            if self.fail_cmd == Some(cmd) {
                return Err(ExecError::Command {
                    code: 1,
                    stderr: "stubbed failure".into(),
                });
            }
            let stdout = if cmd == "systemctl" && args.first() == Some(&"status") {
                STATUS_OUTPUT.to_string()
            } else if cmd == "git" {
                "Updating 1111111..2222222\nFast-forward\n x\n".to_string()
            } else {
                String::new()
            };
            Ok(ExecOutput {
                stdout,
                stderr: String::new(),
            })
        }
    }

    struct TextRecorder {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl BusListener for TextRecorder {
        async fn on_emission(&self, source: &str, emission: &Emission) {
            if let Emission::Text(_, msg) = emission {
                self.seen.lock().await.push(format!("{source}: {msg}"));
            }
        }
    }

    async fn watched_instance(fail_cmd: Option<&'static str>) -> (Arc<Instance>, Arc<GitModule>, Arc<StubRoot>) {
        let config: Config = toml::from_str(
            r#"
            [http]
            host = "::"
            port = 8000

            [[service]]
            name = "api"
            path = "/srv/api"
            [service.git]
            repo = "acme/api"
            pull = true
            restart = true
            "#,
        )
        .unwrap();
        let instance = Instance::new(config).unwrap();
        let stub = StubRoot::new(fail_cmd);
        instance.set_root(stub.clone());

        let module = Arc::new(GitModule::new());
        assert!(module.clone().init(&instance).await.unwrap());

        let service = instance.service("api").unwrap();
        *service.git.lock().await = Some(GitState {
            repo: "api".into(),
            branch: "main".into(),
        });
        (instance, module, stub)
    }

    fn push(repo: &str, git_ref: &str) -> Emission {
        Emission::Event(BusEvent::GitPush(PushEvent {
            host: "GitHub".into(),
            service: "api".into(),
            username: "alice".into(),
            repo: repo.into(),
            url: String::new(),
            git_ref: git_ref.into(),
            commits: vec![],
        }))
    }

    #[tokio::test]
    async fn matching_push_pulls_then_restarts_in_order() {
        let (instance, module, stub) = watched_instance(None).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        instance
            .bus
            .logger("Test")
            .listen(Arc::new(TextRecorder { seen: seen.clone() }))
            .await;

        module
            .on_emission("GitHub", &push("acme/api", "refs/heads/main"))
            .await;

        assert_eq!(
            stub.calls().await,
            vec![
                "git -C /srv/api pull".to_string(),
                "systemctl restart api".to_string(),
                "systemctl status api -n3".to_string(),
            ]
        );

        let seen = seen.lock().await;
        let pull_log = seen
            .iter()
            .find(|line| line.contains("Pulling repository acme/api"))
            .expect("pull log line");
        assert!(pull_log.contains("Fast-forward"));
        assert!(!pull_log.contains("\n x"), "single-char lines are dropped");
        let restart_log = seen
            .iter()
            .find(|line| line.contains("Restarting service api"))
            .expect("restart log line");
        assert!(restart_log.contains("Active: active (running)"));
        assert!(!restart_log.contains(" since "), "since clause is cut");
    }

    #[tokio::test]
    async fn failed_pull_never_restarts() {
        let (_instance, module, stub) = watched_instance(Some("git")).await;
        module
            .on_emission("GitHub", &push("acme/api", "refs/heads/main"))
            .await;
        assert_eq!(stub.calls().await, vec!["git -C /srv/api pull".to_string()]);
    }

    #[tokio::test]
    async fn mismatched_repo_or_ref_is_ignored() {
        let (_instance, module, stub) = watched_instance(None).await;
        module
            .on_emission("GitHub", &push("acme/other", "refs/heads/main"))
            .await;
        module
            .on_emission("GitHub", &push("acme/api", "refs/heads/dev"))
            .await;
        assert!(stub.calls().await.is_empty());
    }

    #[tokio::test]
    async fn undetected_service_is_not_watched() {
        let (instance, module, stub) = watched_instance(None).await;
        *instance.service("api").unwrap().git.lock().await = None;
        module
            .on_emission("GitHub", &push("acme/api", "refs/heads/main"))
            .await;
        assert!(stub.calls().await.is_empty());
    }

    #[tokio::test]
    async fn detected_branch_is_used_when_not_overridden() {
        let (instance, module, stub) = watched_instance(None).await;
        *instance.service("api").unwrap().git.lock().await = Some(GitState {
            repo: "api".into(),
            branch: "release".into(),
        });
        module
            .on_emission("GitHub", &push("acme/api", "refs/heads/main"))
            .await;
        assert!(stub.calls().await.is_empty(), "main is not the detected branch");

        module
            .on_emission("GitHub", &push("acme/api", "refs/heads/release"))
            .await;
        assert_eq!(stub.calls().await.len(), 3);
    }

    #[test]
    fn remote_urls_reduce_to_owner_slash_name() {
        assert_eq!(
            repo_from_remote_url("https://github.com/acme/api.git\n").unwrap(),
            "acme/api"
        );
        assert_eq!(
            repo_from_remote_url("git@github.com:acme/api.git").unwrap(),
            "acme/api"
        );
        assert_eq!(
            repo_from_remote_url("https://github.com/api.git").unwrap(),
            "api"
        );
        assert!(repo_from_remote_url("  \n").is_err());
    }

    #[test]
    fn status_excerpt_keeps_active_line_and_journal_tail() {
        let excerpt = status_excerpt(STATUS_OUTPUT);
        let lines: Vec<&str> = excerpt.lines().collect();
        assert_eq!(lines[0], "Active: active (running)");
        assert_eq!(lines[1], "Started api.service - Acme API.");
        assert_eq!(lines[2], "listening on /run/api.sock");
        assert_eq!(lines[3], "ready");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn trimmed_lines_drop_blank_and_single_char_lines() {
        assert_eq!(trimmed_lines("  a\n\n ok \nx\nfine\n"), "ok\nfine");
    }
}
