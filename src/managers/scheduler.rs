use serde::Serialize;
use tracing::info;

use super::Host;
use crate::dispatch::{CommandTemplate, Parsed};
use crate::error::{Error, ExecError, Result};
use crate::exec::CommandResult;
use crate::profile::InitSystem;

const CRONTAB_LIST: CommandTemplate = CommandTemplate::new("crontab", &["-l"]);
const CRONTAB_INSTALL: CommandTemplate = CommandTemplate::new("crontab", &["-"]);
const LIST_TIMERS: CommandTemplate = CommandTemplate::new(
    "systemctl",
    &["list-timers", "--all", "--no-legend", "--no-pager"],
);

const SPECIAL_SCHEDULES: &[&str] = &[
    "@reboot", "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CronJob {
    /// 1-based position among the job lines of the table.
    pub index: usize,
    pub schedule: String,
    pub command: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Timer {
    pub unit: String,
    pub activates: String,
    pub next: Option<String>,
}

pub struct Scheduler {
    host: Host,
}

impl Scheduler {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    pub async fn list(&self) -> Result<Vec<CronJob>> {
        let table = self.table().await?;
        Ok(parse_crontab(&table).into_records("crontab"))
    }

    pub async fn add(&self, schedule: &str, command: &str) -> Result<CommandResult> {
        validate_schedule(schedule)?;
        let command = command.trim();
        if command.is_empty() || command.contains('\n') {
            return Err(Error::InvalidArgument("cron command must be a single non-empty line".into()));
        }
        let mut table = self.table().await?;
        if !table.is_empty() && !table.ends_with('\n') {
            table.push('\n');
        }
        table.push_str(&format!("{schedule} {command}\n"));
        info!(schedule, command, "adding cron job");
        self.install(&table).await
    }

    pub async fn remove(&self, index: usize) -> Result<CommandResult> {
        let table = self.table().await?;
        let mut seen = 0;
        let mut removed = false;
        let mut kept = String::new();
        for line in table.lines() {
            if parse_job_line(line).is_some() {
                seen += 1;
                if seen == index {
                    removed = true;
                    continue;
                }
            }
            kept.push_str(line);
            kept.push('\n');
        }
        if !removed {
            return Err(Error::InvalidArgument(format!("no cron job with index {index}")));
        }
        info!(index, "removing cron job");
        self.install(&kept).await
    }

    pub async fn timers(&self) -> Result<Vec<Timer>> {
        let init = self.host.profile().init_system;
        if init != InitSystem::Systemd {
            return Err(Error::unsupported_operation("list timers", init));
        }
        let out = self.host.run("list timers", &LIST_TIMERS.render(&[])).await?;
        Ok(parse_timers(&out.stdout).into_records("systemctl"))
    }

    /// The raw crontab; a user without one has an empty table.
    async fn table(&self) -> Result<String> {
        let inv = CRONTAB_LIST.render(&[]);
        let out = self.host.run_any_exit("read crontab", &inv).await?;
        if out.success() {
            return Ok(out.stdout);
        }
        if out.stderr.contains("no crontab") {
            return Ok(String::new());
        }
        Err(Error::Exec {
            operation: "read crontab".to_string(),
            source: ExecError::Exit {
                program: inv.program,
                result: out,
            },
        })
    }

    async fn install(&self, table: &str) -> Result<CommandResult> {
        self.host
            .run_with_input("install crontab", &CRONTAB_INSTALL.render(&[]), table.as_bytes())
            .await
    }
}

fn validate_schedule(schedule: &str) -> Result<()> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let ok = match fields.as_slice() {
        [special] => SPECIAL_SCHEDULES.contains(special),
        five if five.len() == 5 => five.iter().all(|f| {
            f.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-'))
        }),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid cron schedule: {schedule:?}")))
    }
}

fn parse_job_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let first = line.split_whitespace().next()?;
    if first.contains('=') {
        return None;
    }
    let width = if first.starts_with('@') { 1 } else { 5 };
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() <= width {
        return None;
    }
    Some((tokens[..width].join(" "), tokens[width..].join(" ")))
}

/// `crontab -l`. Comments and environment assignments are not jobs.
pub fn parse_crontab(raw: &str) -> Parsed<CronJob> {
    let mut parsed = Parsed::default();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_job_line(line) {
            Some((schedule, command)) => {
                let index = parsed.records.len() + 1;
                parsed.push(CronJob {
                    index,
                    schedule,
                    command,
                });
            }
            None if trimmed.split_whitespace().next().is_some_and(|t| t.contains('=')) => {}
            None => parsed.skip(),
        }
    }
    parsed
}

/// `systemctl list-timers --no-legend`: `NEXT LEFT LAST PASSED UNIT ACTIVATES`,
/// where the time columns have a variable number of words.
pub fn parse_timers(raw: &str) -> Parsed<Timer> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(pos) = tokens.iter().position(|t| t.ends_with(".timer")) else {
            parsed.skip();
            continue;
        };
        let next = match tokens.first() {
            Some(&"n/a") | Some(&"-") | None => None,
            Some(_) if pos >= 4 => Some(tokens[..4].join(" ")),
            Some(_) => None,
        };
        parsed.push(Timer {
            unit: tokens[pos].to_string(),
            activates: tokens.get(pos + 1).copied().unwrap_or_default().to_string(),
            next,
        });
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExecutor;
    use crate::managers::testing::host;
    use crate::profile::SystemProfile;

    const TABLE: &str = "# m h dom mon dow command
MAILTO=ops@example.com
*/5 * * * * /usr/local/bin/backup --quick
@reboot /usr/bin/warmup
0 3 * *
30 2 * * 0 /usr/bin/rotate logs
";

    #[test]
    fn crontab_jobs() {
        let parsed = parse_crontab(TABLE);
        assert_eq!(parsed.skipped, 1);
        let jobs: Vec<(usize, &str, &str)> = parsed
            .records
            .iter()
            .map(|j| (j.index, j.schedule.as_str(), j.command.as_str()))
            .collect();
        assert_eq!(
            jobs,
            vec![
                (1, "*/5 * * * *", "/usr/local/bin/backup --quick"),
                (2, "@reboot", "/usr/bin/warmup"),
                (3, "30 2 * * 0", "/usr/bin/rotate logs"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_crontab_is_empty() {
        let exec = FakeExecutor::new().fail("crontab", 1, "no crontab for alice");
        let (h, _) = host(SystemProfile::default(), exec);
        assert!(Scheduler::new(h).list().await.unwrap().is_empty());

        let exec = FakeExecutor::new().fail("crontab", 1, "crontab: permission denied");
        let (h, _) = host(SystemProfile::default(), exec);
        let err = Scheduler::new(h).list().await.unwrap_err();
        assert_eq!(err.stderr(), Some("crontab: permission denied"));
    }

    #[tokio::test]
    async fn add_appends_and_installs_through_stdin() {
        let exec = FakeExecutor::new().respond("crontab", "MAILTO=root\n0 1 * * * /bin/a");
        let (host, exec) = host(SystemProfile::default(), exec);
        Scheduler::new(host).add("@daily", "/bin/b").await.unwrap();
        let install = exec.last_call();
        assert_eq!(install.argv(), vec!["crontab", "-"]);
        assert_eq!(install.stdin.as_deref(), Some("MAILTO=root\n0 1 * * * /bin/a\n@daily /bin/b\n"));
    }

    #[tokio::test]
    async fn remove_rewrites_without_the_job() {
        let (host, exec) = host(SystemProfile::default(), FakeExecutor::new().respond("crontab", TABLE));
        let scheduler = Scheduler::new(host);
        scheduler.remove(2).await.unwrap();
        let stdin = exec.last_call().stdin.unwrap();
        assert!(!stdin.contains("warmup"));
        assert!(stdin.contains("MAILTO=ops@example.com"));
        assert!(stdin.contains("/usr/bin/rotate logs"));

        assert!(matches!(scheduler.remove(9).await, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn schedules_are_validated() {
        let (host, exec) = host(SystemProfile::default(), FakeExecutor::new());
        let scheduler = Scheduler::new(host);
        assert!(scheduler.add("* * *", "/bin/x").await.is_err());
        assert!(scheduler.add("@sometimes", "/bin/x").await.is_err());
        assert!(scheduler.add("* * * * *", "").await.is_err());
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn timer_rows() {
        let raw = "Sun 2026-10-18 00:00:00 UTC 11h left Sat 2026-10-17 00:00:01 UTC 12h ago logrotate.timer logrotate.service
n/a n/a n/a n/a fstrim.timer fstrim.service
garbage
";
        let parsed = parse_timers(raw);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.records[0].unit, "logrotate.timer");
        assert_eq!(parsed.records[0].activates, "logrotate.service");
        assert_eq!(parsed.records[0].next.as_deref(), Some("Sun 2026-10-18 00:00:00 UTC"));
        assert_eq!(parsed.records[1].next, None);
    }

    #[tokio::test]
    async fn timers_need_systemd() {
        let (host, _) = host(SystemProfile::default(), FakeExecutor::new());
        assert!(matches!(
            Scheduler::new(host).timers().await,
            Err(Error::UnsupportedOperation { .. })
        ));
    }
}
