//! # Line-oriented configuration parsing.
//!
//! Reads the main configuration file plus `*.conf` drop-ins and delivers
//! fully formed [`Svc`] records. Directives:
//!
//! ```text
//! service [2345] <pid/setup,net/iface/lo> pid:/run/foo.pid @ftp:ftp env:DEBUG=1 /sbin/foo -n
//! task    [S]    /sbin/mkcache
//! run     [S]    /sbin/mount-helper
//! sysv    [2345] /etc/init.d/legacy
//! inetd   2323/tcp /sbin/telnetd
//! tty     [12345] /dev/ttyAMA0 115200 vt220
//! runlevel 2
//! rlimit  [hard|soft] nofile 1024
//! include /etc/shared.conf
//! ```
//!
//! Parsing is all-or-nothing: any malformed line rejects the whole load
//! and the previously applied generation stays live. Start-condition
//! cycles over `service/*` edges are detected here and rejected, never
//! resolved.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use nix::sys::resource::Resource;

use crate::config::Config;
use crate::error::ConfError;
use crate::svc::{
    Ident, RlimitRule, RlimitScope, Runlevels, Svc, SvcKind, TtySettings,
};

/// Result of a successful parse.
#[derive(Debug)]
pub struct Conf {
    pub records: Vec<Svc>,
    /// `runlevel N` directive, if present: the level entered after boot.
    pub runlevel: Option<u8>,
}

/// Loads the main file and every `*.conf` drop-in, then validates the
/// dependency graph.
pub fn load(cfg: &Config) -> Result<Conf, ConfError> {
    let mut ctx = ParseCtx::default();
    let mut seen = HashSet::new();

    if cfg.conf_file.exists() {
        parse_file(&cfg.conf_file, cfg, &mut ctx, &mut seen)?;
    }

    if cfg.conf_dir.is_dir() {
        let mut dropins: Vec<PathBuf> = fs::read_dir(&cfg.conf_dir)
            .map_err(|source| ConfError::Read {
                path: cfg.conf_dir.clone(),
                source,
            })?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|x| x == "conf"))
            .collect();
        dropins.sort();
        for path in dropins {
            parse_file(&path, cfg, &mut ctx, &mut seen)?;
        }
    }

    detect_cycles(&ctx.records)?;
    debug!("parsed {} records", ctx.records.len());
    Ok(Conf {
        records: ctx.records,
        runlevel: ctx.runlevel,
    })
}

#[derive(Default)]
struct ParseCtx {
    records: Vec<Svc>,
    runlevel: Option<u8>,
    /// rlimit directives seen so far apply to records parsed after them.
    rlimits: Vec<RlimitRule>,
}

fn parse_file(
    path: &Path,
    cfg: &Config,
    ctx: &mut ParseCtx,
    seen: &mut HashSet<PathBuf>,
) -> Result<(), ConfError> {
    let canon = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(canon) {
        return Err(ConfError::RecursiveInclude {
            file: path.to_path_buf(),
        });
    }

    let content = fs::read_to_string(path).map_err(|source| ConfError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        parse_line(line, path, lineno + 1, cfg, ctx, seen)?;
    }
    Ok(())
}

fn parse_line(
    line: &str,
    file: &Path,
    lineno: usize,
    cfg: &Config,
    ctx: &mut ParseCtx,
    seen: &mut HashSet<PathBuf>,
) -> Result<(), ConfError> {
    let malformed = |reason: &str| ConfError::Malformed {
        file: file.to_path_buf(),
        line: lineno,
        reason: reason.to_string(),
    };

    let mut tokens = line.split_whitespace();
    let keyword = tokens.next().unwrap();
    let rest: Vec<&str> = tokens.collect();

    match keyword {
        "include" => {
            let target = rest.first().ok_or_else(|| malformed("include needs a path"))?;
            parse_file(Path::new(target), cfg, ctx, seen)
        }
        "runlevel" => {
            let arg = rest.first().ok_or_else(|| malformed("runlevel needs a level"))?;
            let level: u8 = arg
                .parse()
                .ok()
                .filter(|l| *l <= 9)
                .ok_or_else(|| malformed("runlevel must be 0-9"))?;
            ctx.runlevel = Some(level);
            Ok(())
        }
        "rlimit" => {
            let rule = parse_rlimit(&rest).ok_or_else(|| {
                malformed("expected: rlimit [hard|soft] RESOURCE <limit|unlimited>")
            })?;
            ctx.rlimits.push(rule);
            Ok(())
        }
        "service" | "task" | "run" | "sysv" | "inetd" | "tty" => {
            let kind = match keyword {
                "service" => SvcKind::Service,
                "task" => SvcKind::Task,
                "run" => SvcKind::Run,
                "sysv" => SvcKind::Sysv,
                "inetd" => SvcKind::Inetd,
                "tty" => SvcKind::Tty,
                _ => unreachable!(),
            };
            let svc = parse_record(kind, &rest, cfg, ctx).map_err(|r| malformed(&r))?;
            ctx.records.push(svc);
            Ok(())
        }
        other => Err(ConfError::UnknownKind {
            file: file.to_path_buf(),
            line: lineno,
            kind: other.to_string(),
        }),
    }
}

fn parse_record(
    kind: SvcKind,
    tokens: &[&str],
    cfg: &Config,
    ctx: &ParseCtx,
) -> Result<Svc, String> {
    let mut id: Option<String> = None;
    let mut levels: Option<Runlevels> = None;
    let mut conds: Vec<String> = Vec::new();
    let mut pidfile: Option<PathBuf> = None;
    let mut user: Option<String> = None;
    let mut group: Option<String> = None;
    let mut env: Vec<(String, String)> = Vec::new();
    let mut it = tokens.iter().peekable();

    while let Some(tok) = it.peek() {
        if let Some(rest) = tok.strip_prefix(':') {
            if rest.is_empty() {
                return Err("empty instance id".into());
            }
            id = Some(rest.to_string());
        } else if tok.starts_with('[') && tok.ends_with(']') {
            levels = Some(
                Runlevels::parse(&tok[1..tok.len() - 1])
                    .ok_or_else(|| format!("bad runlevels '{tok}'"))?,
            );
        } else if tok.starts_with('<') && tok.ends_with('>') {
            conds = tok[1..tok.len() - 1]
                .split(',')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        } else if let Some(path) = tok.strip_prefix("pid:") {
            pidfile = Some(PathBuf::from(path));
        } else if let Some(spec) = tok.strip_prefix("env:") {
            let (k, v) = spec.split_once('=').ok_or("env: needs KEY=VALUE")?;
            env.push((k.to_string(), v.to_string()));
        } else if kind != SvcKind::Tty && tok.starts_with('@') && tok.len() > 1 {
            let spec = &tok[1..];
            match spec.split_once(':') {
                Some((u, g)) => {
                    user = Some(u.to_string());
                    group = Some(g.to_string());
                }
                None => user = Some(spec.to_string()),
            }
        } else {
            break;
        }
        it.next();
    }

    let tail: Vec<&str> = it.copied().collect();

    let mut svc = match kind {
        SvcKind::Tty => {
            let dev = *tail.first().ok_or("tty needs a device")?;
            let name = Path::new(dev)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dev.to_string())
                .trim_start_matches('@')
                .to_string();
            let mut args: Vec<String> = vec![dev.to_string()];
            args.extend(tail[1..].iter().map(|s| s.to_string()));
            let mut svc = Svc::new(
                Ident {
                    kind,
                    name,
                    id: id.clone(),
                },
                cfg.getty.clone(),
                args,
            );
            svc.tty = Some(TtySettings {
                dev: dev.to_string(),
                baud: tail.get(1).map(|s| s.to_string()),
                term: tail.get(2).map(|s| s.to_string()),
            });
            svc
        }
        SvcKind::Inetd => {
            let port_spec = *tail.first().ok_or("inetd needs a port")?;
            let port: u16 = port_spec
                .split('/')
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| format!("bad inetd port '{port_spec}'"))?;
            let cmd = PathBuf::from(*tail.get(1).ok_or("inetd needs a command")?);
            let args = tail[2..].iter().map(|s| s.to_string()).collect();
            let mut svc = Svc::new(Ident::new(kind, &cmd, id.as_deref()), cmd, args);
            svc.port = Some(port);
            svc
        }
        _ => {
            let cmd = PathBuf::from(*tail.first().ok_or("missing command")?);
            let mut args: Vec<String> = tail[1..].iter().map(|s| s.to_string()).collect();
            if kind == SvcKind::Sysv {
                args.insert(0, "start".to_string());
            }
            Svc::new(Ident::new(kind, &cmd, id.as_deref()), cmd, args)
        }
    };

    svc.runlevels = levels.unwrap_or(Runlevels::DEFAULT);
    svc.conds = conds;
    svc.pidfile = pidfile;
    svc.user = user;
    svc.group = group;
    svc.env = env;
    svc.respawn = cfg.respawn;
    svc.rlimits = ctx.rlimits.clone();
    Ok(svc)
}

fn parse_rlimit(tokens: &[&str]) -> Option<RlimitRule> {
    let (scope, rest) = match tokens.first()? {
        &"hard" => (RlimitScope::Hard, &tokens[1..]),
        &"soft" => (RlimitScope::Soft, &tokens[1..]),
        _ => (RlimitScope::Both, tokens),
    };
    let resource = match *rest.first()? {
        "as" | "vmem" => Resource::RLIMIT_AS,
        "core" => Resource::RLIMIT_CORE,
        "cpu" => Resource::RLIMIT_CPU,
        "data" => Resource::RLIMIT_DATA,
        "fsize" => Resource::RLIMIT_FSIZE,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "nofile" => Resource::RLIMIT_NOFILE,
        "nproc" => Resource::RLIMIT_NPROC,
        "stack" => Resource::RLIMIT_STACK,
        _ => return None,
    };
    let limit = match *rest.get(1)? {
        "unlimited" | "infinity" => None,
        n => Some(n.parse().ok()?),
    };
    Some(RlimitRule {
        resource,
        scope,
        limit,
    })
}

/// DFS over `service/*` start-condition edges. A cycle is a config error.
fn detect_cycles(records: &[Svc]) -> Result<(), ConfError> {
    let by_name: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .map(|(i, s)| (s.ident.to_string(), i))
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }
    let mut marks = vec![Mark::White; records.len()];

    fn visit(
        i: usize,
        records: &[Svc],
        by_name: &HashMap<String, usize>,
        marks: &mut [Mark],
        chain: &mut Vec<String>,
    ) -> Result<(), ConfError> {
        marks[i] = Mark::Grey;
        chain.push(records[i].ident.to_string());

        for cond in &records[i].conds {
            let Some(target) = cond.strip_prefix("service/") else { continue };
            let Some(&j) = by_name.get(target) else { continue };
            match marks[j] {
                Mark::Grey => {
                    let mut cycle = chain.clone();
                    cycle.push(records[j].ident.to_string());
                    return Err(ConfError::Cycle { chain: cycle });
                }
                Mark::White => visit(j, records, by_name, marks, chain)?,
                Mark::Black => {}
            }
        }

        chain.pop();
        marks[i] = Mark::Black;
        Ok(())
    }

    for i in 0..records.len() {
        if marks[i] == Mark::White {
            let mut chain = Vec::new();
            visit(i, records, &by_name, &mut marks, &mut chain)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn conf_with(content: &str) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("initvisor.conf");
        let mut f = fs::File::create(&file).unwrap();
        f.write_all(content.as_bytes()).unwrap();

        let mut cfg = Config::default();
        cfg.conf_file = file;
        cfg.conf_dir = dir.path().join("initvisor.d");
        (dir, cfg)
    }

    #[test]
    fn parses_full_service_line() {
        let (_d, cfg) = conf_with(
            "service [2345] <pid/setup,net/iface/lo> pid:/run/foo.pid @ftp:ftp env:DEBUG=1 /sbin/foo -n\n",
        );
        let conf = load(&cfg).unwrap();
        assert_eq!(conf.records.len(), 1);

        let svc = &conf.records[0];
        assert_eq!(svc.ident.kind, SvcKind::Service);
        assert_eq!(svc.ident.name, "foo");
        assert_eq!(svc.cmd, PathBuf::from("/sbin/foo"));
        assert_eq!(svc.args, vec!["-n".to_string()]);
        assert!(svc.runlevels.contains(2) && svc.runlevels.contains(5));
        assert_eq!(svc.conds, vec!["pid/setup", "net/iface/lo"]);
        assert_eq!(svc.pidfile, Some(PathBuf::from("/run/foo.pid")));
        assert_eq!(svc.user.as_deref(), Some("ftp"));
        assert_eq!(svc.group.as_deref(), Some("ftp"));
        assert_eq!(svc.env, vec![("DEBUG".to_string(), "1".to_string())]);
    }

    #[test]
    fn parses_instance_id() {
        let (_d, cfg) = conf_with("service :1 [2] /sbin/worker\nservice :2 [2] /sbin/worker\n");
        let conf = load(&cfg).unwrap();
        assert_eq!(conf.records[0].ident.to_string(), "worker:1");
        assert_eq!(conf.records[1].ident.to_string(), "worker:2");
    }

    #[test]
    fn parses_tty_and_inetd_and_sysv() {
        let (_d, cfg) = conf_with(
            "tty [12345] /dev/ttyAMA0 115200 vt220\n\
             inetd 2323/tcp /sbin/telnetd -i\n\
             sysv [2] /etc/init.d/legacy --flag\n",
        );
        let conf = load(&cfg).unwrap();

        let tty = &conf.records[0];
        assert_eq!(tty.ident.kind, SvcKind::Tty);
        assert_eq!(tty.ident.name, "ttyAMA0");
        let settings = tty.tty.as_ref().unwrap();
        assert_eq!(settings.baud.as_deref(), Some("115200"));
        assert_eq!(settings.term.as_deref(), Some("vt220"));

        let inetd = &conf.records[1];
        assert_eq!(inetd.port, Some(2323));
        assert_eq!(inetd.cmd, PathBuf::from("/sbin/telnetd"));

        let sysv = &conf.records[2];
        assert_eq!(sysv.args, vec!["start".to_string(), "--flag".to_string()]);
    }

    #[test]
    fn runlevel_and_rlimit_directives() {
        let (_d, cfg) = conf_with(
            "runlevel 3\n\
             rlimit hard nofile 1024\n\
             service [3] /sbin/after\n",
        );
        let conf = load(&cfg).unwrap();
        assert_eq!(conf.runlevel, Some(3));
        let svc = &conf.records[0];
        assert_eq!(svc.rlimits.len(), 1);
        assert_eq!(svc.rlimits[0].scope, RlimitScope::Hard);
        assert_eq!(svc.rlimits[0].limit, Some(1024));
    }

    #[test]
    fn malformed_line_rejects_whole_file() {
        let (_d, cfg) = conf_with("service [2] /sbin/good\nfrobnicate all the things\n");
        let err = load(&cfg).unwrap_err();
        assert!(matches!(err, ConfError::UnknownKind { .. }));
    }

    #[test]
    fn bad_runlevels_reject() {
        let (_d, cfg) = conf_with("service [2x] /sbin/foo\n");
        assert!(matches!(load(&cfg), Err(ConfError::Malformed { .. })));
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let (_d, cfg) = conf_with(
            "service [2] <service/b> /sbin/a\n\
             service [2] <service/c> /sbin/b\n\
             service [2] <service/a> /sbin/c\n",
        );
        let err = load(&cfg).unwrap_err();
        match err {
            ConfError::Cycle { chain } => {
                assert!(chain.len() >= 3, "chain: {chain:?}");
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let (_d, cfg) = conf_with("service [2] <service/me> /sbin/me\n");
        assert!(matches!(load(&cfg), Err(ConfError::Cycle { .. })));
    }

    #[test]
    fn non_service_conditions_are_not_edges() {
        let (_d, cfg) = conf_with(
            "service [2] <pid/b,hook/basefs-up> /sbin/a\n\
             service [2] <service/a> /sbin/b\n",
        );
        assert!(load(&cfg).is_ok());
    }

    #[test]
    fn dropins_are_loaded_sorted() {
        let (_d, mut cfg) = conf_with("service [2] /sbin/main\n");
        fs::create_dir(&cfg.conf_dir).unwrap();
        fs::write(cfg.conf_dir.join("20-second.conf"), "task [2] /sbin/late\n").unwrap();
        fs::write(cfg.conf_dir.join("10-first.conf"), "task [2] /sbin/early\n").unwrap();
        fs::write(cfg.conf_dir.join("ignored.txt"), "not parsed\n").unwrap();

        cfg.respawn = crate::policy::RespawnPolicy::default();
        let conf = load(&cfg).unwrap();
        let names: Vec<_> = conf.records.iter().map(|s| s.ident.name.clone()).collect();
        assert_eq!(names, vec!["main", "early", "late"]);
    }

    #[test]
    fn include_follows_and_detects_recursion() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.conf");
        let extra = dir.path().join("extra.conf");
        fs::write(&main, format!("include {}\n", extra.display())).unwrap();
        fs::write(&extra, "task [2] /sbin/included\n").unwrap();

        let mut cfg = Config::default();
        cfg.conf_file = main.clone();
        cfg.conf_dir = dir.path().join("none.d");
        let conf = load(&cfg).unwrap();
        assert_eq!(conf.records[0].ident.name, "included");

        // A file including itself errors out.
        fs::write(&extra, format!("include {}\n", main.display())).unwrap();
        assert!(matches!(
            load(&cfg),
            Err(ConfError::RecursiveInclude { .. })
        ));
    }

    #[test]
    fn identical_files_parse_to_identical_records() {
        let (_d, cfg) = conf_with("service [2] <pid/x> pid:/run/a.pid /sbin/a --flag\n");
        let one = load(&cfg).unwrap();
        let two = load(&cfg).unwrap();
        assert!(one.records[0].same_config(&two.records[0]));
    }
}
