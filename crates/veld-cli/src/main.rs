//! veld CLI: operate on on-disk veld repositories.

use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use veld_core::lock::{LockInfo, LockState};
use veld_core::tree::ChangeKind;
use veld_core::{
    ChangesetId, CommitRequest, PushOptions, Repository, RevSpec, Tree, UserId, VeldError,
};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "veld", about = "veld: distributed history with branches and locks", version)]
struct Cli {
    /// Acting user name. Defaults to $VELD_USER.
    #[arg(long, global = true)]
    user: Option<String>,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace). $VELD_LOG wins.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new veld repository.
    Init,

    /// Manage users.
    User {
        #[command(subcommand)]
        action: UserCommands,
    },

    /// Record a commit built from the parent's tree plus edits.
    Commit {
        /// Commit message.
        #[arg(long, short)]
        message: String,

        /// Branch to advance.
        #[arg(long, default_value = "master")]
        branch: String,

        /// Parent revision. Defaults to the branch's single head.
        #[arg(long = "parent")]
        parents: Vec<String>,

        /// Add a file: <path>=<content>.
        #[arg(long)]
        add: Vec<String>,

        /// Replace a file's content: <path>=<content>.
        #[arg(long)]
        modify: Vec<String>,

        /// Remove a file.
        #[arg(long)]
        remove: Vec<String>,

        /// Rename a file: <from>:<to>.
        #[arg(long)]
        rename: Vec<String>,
    },

    /// Show commit history, newest first.
    Log {
        /// Output format: "human" (default), "json", or "brief".
        #[arg(long, default_value = "human")]
        format: String,

        /// Maximum number of commits to show.
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Inspect one commit.
    Show {
        /// Revision: id prefix, r:<revno>, b:<branch> or t:<tag>.
        rev: String,

        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Compare the trees of two commits.
    Status {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Manage branch heads.
    Branch {
        #[command(subcommand)]
        action: BranchCommands,
    },

    /// List every branch head and whether its commit is present here.
    Heads {
        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Lock a path on a branch.
    Lock {
        path: String,

        #[arg(long, default_value = "master")]
        branch: String,
    },

    /// Release your lock on a path.
    Unlock { path: String },

    /// List locks.
    Locks {
        /// Include completed locks.
        #[arg(long)]
        all: bool,

        /// Only locks on this path.
        #[arg(long)]
        path: Option<String>,

        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Manage tags.
    Tag {
        #[command(subcommand)]
        action: TagCommands,
    },

    /// Manage commit comments.
    Comment {
        #[command(subcommand)]
        action: CommentCommands,
    },

    /// Manage remotes.
    Remote {
        #[command(subcommand)]
        action: RemoteCommands,
    },

    /// Push history to a remote.
    Push {
        remote: String,

        /// Only validate (and send history for) this branch.
        #[arg(long)]
        branch: Option<String>,

        /// Accept branches left with several heads.
        #[arg(long)]
        force: bool,

        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Pull history from a remote.
    Pull {
        remote: String,

        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        force: bool,

        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Compare this repository with another one on disk.
    Compare {
        other: PathBuf,

        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user.
    Add { name: String },
    /// List users.
    List {
        #[arg(long, default_value = "human")]
        format: String,
    },
}

#[derive(Subcommand)]
enum BranchCommands {
    /// List branches.
    List {
        #[arg(long, default_value = "human")]
        format: String,
    },
    /// Record an additional head.
    AddHead { branch: String, rev: String },
    /// Drop a head record.
    RemoveHead { branch: String, rev: String },
    /// Replace one head with another.
    MoveHead { branch: String, from: String, to: String },
    /// Mark a branch closed.
    Close { branch: String },
    /// Reopen a closed branch.
    Reopen { branch: String },
    /// Drop head records that are ancestors of other heads.
    Prune { branch: String },
}

#[derive(Subcommand)]
enum TagCommands {
    Add { name: String, rev: String },
    Remove { name: String },
    List {
        #[arg(long, default_value = "human")]
        format: String,
    },
}

#[derive(Subcommand)]
enum CommentCommands {
    Add { rev: String, text: String },
    List { rev: String },
}

#[derive(Subcommand)]
enum RemoteCommands {
    Add { name: String, path: String },
    Remove { name: String },
    List,
}

/// Where to run and as whom.
struct Ctx {
    cwd: PathBuf,
    user: Option<String>,
}

impl Ctx {
    fn repo(&self) -> CliResult<Repository> {
        debug!(path = %self.cwd.display(), "opening repository");
        Ok(Repository::open(&self.cwd)?)
    }

    fn acting_user(&self, repo: &Repository) -> CliResult<UserId> {
        let name = self
            .user
            .clone()
            .or_else(|| std::env::var("VELD_USER").ok())
            .ok_or("no acting user: pass --user or set VELD_USER")?;
        Ok(repo.user_by_name(&name)?)
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("VELD_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cwd = std::env::current_dir().unwrap_or_else(|e| {
        eprintln!("error: cannot determine current directory: {e}");
        process::exit(1);
    });
    let ctx = Ctx {
        cwd,
        user: cli.user,
    };

    if let Err(e) = run(&ctx, cli.command) {
        match e.downcast_ref::<VeldError>() {
            Some(err) => {
                eprintln!("error[{}]: {err}", err.code().as_str());
                if matches!(err, VeldError::AmbiguousHeads { .. }) {
                    eprintln!("  merge the heads first, or push again with --force");
                } else if err.code().is_retryable() {
                    eprintln!("  nothing was applied; the operation can be retried");
                }
            }
            None => eprintln!("error: {e}"),
        }
        process::exit(1);
    }
}

fn run(ctx: &Ctx, command: Commands) -> CliResult<()> {
    match command {
        Commands::Init => cmd_init(&ctx.cwd),
        Commands::User { action } => match action {
            UserCommands::Add { name } => cmd_user_add(ctx, &name),
            UserCommands::List { format } => cmd_user_list(ctx, &format),
        },
        Commands::Commit {
            message,
            branch,
            parents,
            add,
            modify,
            remove,
            rename,
        } => {
            let edits = Edits {
                add,
                modify,
                remove,
                rename,
            };
            cmd_commit(ctx, &message, &branch, &parents, &edits)
        }
        Commands::Log { format, limit } => cmd_log(ctx, &format, limit),
        Commands::Show { rev, format } => cmd_show(ctx, &rev, &format),
        Commands::Status { from, to, format } => cmd_status(ctx, &from, &to, &format),
        Commands::Branch { action } => cmd_branch(ctx, action),
        Commands::Heads { format } => cmd_heads(ctx, &format),
        Commands::Lock { path, branch } => cmd_lock(ctx, &path, &branch),
        Commands::Unlock { path } => cmd_unlock(ctx, &path),
        Commands::Locks { all, path, format } => cmd_locks(ctx, all, path.as_deref(), &format),
        Commands::Tag { action } => cmd_tag(ctx, action),
        Commands::Comment { action } => cmd_comment(ctx, action),
        Commands::Remote { action } => cmd_remote(ctx, action),
        Commands::Push {
            remote,
            branch,
            force,
            format,
        } => cmd_sync(ctx, Direction::Push, &remote, branch, force, &format),
        Commands::Pull {
            remote,
            branch,
            force,
            format,
        } => cmd_sync(ctx, Direction::Pull, &remote, branch, force, &format),
        Commands::Compare { other, format } => cmd_compare(ctx, &other, &format),
    }
}

fn resolve(repo: &Repository, spec: &str) -> CliResult<ChangesetId> {
    let spec: RevSpec = spec.parse()?;
    Ok(repo.resolve(&spec)?)
}

fn user_names(repo: &Repository) -> BTreeMap<UserId, String> {
    repo.users().into_iter().map(|u| (u.id, u.name)).collect()
}

fn display_user(names: &BTreeMap<UserId, String>, id: &UserId) -> String {
    names.get(id).cloned().unwrap_or_else(|| id.to_string())
}

fn cmd_init(cwd: &Path) -> CliResult<()> {
    Repository::init(cwd)?;
    println!("initialized veld repository in .veld/");
    Ok(())
}

fn cmd_user_add(ctx: &Ctx, name: &str) -> CliResult<()> {
    let repo = ctx.repo()?;
    let id = repo.create_user(name)?;
    println!("created user {name} ({id})");
    Ok(())
}

fn cmd_user_list(ctx: &Ctx, format: &str) -> CliResult<()> {
    let users = ctx.repo()?.users();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&users)?),
        _ => {
            for u in &users {
                println!("{}  {}", u.name, u.id);
            }
        }
    }
    Ok(())
}

/// Tree edits applied on top of the parent's tree.
#[derive(Debug, Default)]
struct Edits {
    add: Vec<String>,
    modify: Vec<String>,
    remove: Vec<String>,
    rename: Vec<String>,
}

fn split_arg(arg: &str, sep: char) -> CliResult<(&str, &str)> {
    let pair = arg
        .split_once(sep)
        .ok_or_else(|| format!("invalid argument '{arg}': expected a '{sep}' separator"))?;
    Ok(pair)
}

impl Edits {
    fn apply(&self, tree: &mut Tree) -> CliResult<()> {
        for arg in &self.add {
            let (path, content) = split_arg(arg, '=')?;
            tree.add_file(path, content.as_bytes())?;
        }
        for arg in &self.modify {
            let (path, content) = split_arg(arg, '=')?;
            tree.modify(path, content.as_bytes())?;
        }
        for path in &self.remove {
            tree.remove(path)?;
        }
        for arg in &self.rename {
            let (from, to) = split_arg(arg, ':')?;
            tree.rename(from, to)?;
        }
        Ok(())
    }
}

fn cmd_commit(
    ctx: &Ctx,
    message: &str,
    branch: &str,
    parents: &[String],
    edits: &Edits,
) -> CliResult<()> {
    let repo = ctx.repo()?;
    let author = ctx.acting_user(&repo)?;

    let parents: Vec<ChangesetId> = if parents.is_empty() {
        match repo.resolve(&RevSpec::Branch(branch.to_string())) {
            Ok(head) => vec![head],
            Err(VeldError::BranchNotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        }
    } else {
        parents
            .iter()
            .map(|p| resolve(&repo, p))
            .collect::<CliResult<_>>()?
    };

    let mut tree = match parents.first() {
        Some(first) => repo.tree(&RevSpec::Id(first.to_string()))?,
        None => Tree::new(),
    };
    edits.apply(&mut tree)?;

    let mut request = CommitRequest::new(&author, message, tree).on_branch(branch);
    for p in &parents {
        request = request.parent(p);
    }
    let id = repo.commit(request)?;
    let revno = repo.revno(&id).unwrap_or_default();
    println!("committed {}:{} on {branch}", revno, id.short());
    Ok(())
}

fn cmd_log(ctx: &Ctx, format: &str, limit: Option<usize>) -> CliResult<()> {
    let repo = ctx.repo()?;
    let mut log = repo.log();
    if let Some(n) = limit {
        log.truncate(n);
    }

    match format {
        "json" => {
            let changesets: Vec<_> = log.iter().map(|(_, cs)| cs).collect();
            println!("{}", serde_json::to_string_pretty(&changesets)?);
        }
        "brief" => {
            let names = user_names(&repo);
            for (revno, cs) in &log {
                if let Some(commit) = cs.commit() {
                    println!(
                        "{revno}:{} {} {}",
                        cs.id.short(),
                        display_user(&names, &commit.author),
                        commit.message
                    );
                }
            }
        }
        _ => {
            if log.is_empty() {
                println!("no commits yet");
                return Ok(());
            }
            let names = user_names(&repo);
            for (i, (revno, cs)) in log.iter().enumerate() {
                let Some(commit) = cs.commit() else { continue };
                if i > 0 {
                    println!();
                }
                println!("commit {revno}:{}", cs.id.short());
                println!("  author:  {}", display_user(&names, &commit.author));
                println!("  time:    {}", commit.when.format("%Y-%m-%d %H:%M:%S UTC"));
                if cs.is_merge() {
                    let parents: Vec<&str> = cs.parents.iter().map(|p| p.short()).collect();
                    println!("  merge:   {}", parents.join(" "));
                }
                println!("  message: {}", commit.message);
            }
        }
    }
    Ok(())
}

fn change_marker(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Added => "+  add",
        ChangeKind::Modified => "~  mod",
        ChangeKind::Deleted => "-  del",
        ChangeKind::Moved => ">  mov",
        ChangeKind::MovedModified => ">~ mov",
    }
}

fn cmd_show(ctx: &Ctx, rev: &str, format: &str) -> CliResult<()> {
    let repo = ctx.repo()?;
    let id = resolve(&repo, rev)?;
    let cs = repo.changeset(&id)?;
    let changes = repo.changes(&RevSpec::Id(id.to_string()))?;

    match format {
        "json" => {
            let out = serde_json::json!({ "changeset": cs, "changes": changes });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        _ => {
            let names = user_names(&repo);
            println!("commit {}", cs.id);
            if let Some(revno) = repo.revno(&id) {
                println!("  revno:   {revno}");
            }
            for p in &cs.parents {
                println!("  parent:  {p}");
            }
            if let Some(commit) = cs.commit() {
                println!("  author:  {}", display_user(&names, &commit.author));
                println!("  time:    {}", commit.when.format("%Y-%m-%d %H:%M:%S UTC"));
                println!("  message: {}", commit.message);
            }
            println!("  changes: {} file(s)", changes.len());
            for c in &changes {
                match &c.old_path {
                    Some(old) => println!("    {}  {old} -> {}", change_marker(c.kind), c.path),
                    None => println!("    {}  {}", change_marker(c.kind), c.path),
                }
            }
            for comment in repo.comments(&id) {
                println!(
                    "  comment: {} ({})",
                    comment.text,
                    display_user(&names, &comment.audit.user)
                );
            }
        }
    }
    Ok(())
}

fn cmd_status(ctx: &Ctx, from: &str, to: &str, format: &str) -> CliResult<()> {
    let repo = ctx.repo()?;
    let from: RevSpec = from.parse()?;
    let to: RevSpec = to.parse()?;
    let changes = repo.status(&from, &to)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&changes)?),
        _ => {
            if changes.is_empty() {
                println!("no differences");
            }
            for c in &changes {
                match &c.old_path {
                    Some(old) => println!("  {}  {old} -> {}", change_marker(c.kind), c.path),
                    None => println!("  {}  {}", change_marker(c.kind), c.path),
                }
            }
        }
    }
    Ok(())
}

fn cmd_branch(ctx: &Ctx, action: BranchCommands) -> CliResult<()> {
    let repo = ctx.repo()?;
    match action {
        BranchCommands::List { format } => {
            let branches = repo.branches();
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&branches)?),
                _ => {
                    for b in &branches {
                        let heads: Vec<&str> = b.heads.iter().map(|h| h.short()).collect();
                        let mut flags = Vec::new();
                        if b.closed {
                            flags.push("closed");
                        }
                        if b.needs_merge {
                            flags.push("needs merge");
                        }
                        let flags = if flags.is_empty() {
                            String::new()
                        } else {
                            format!("  ({})", flags.join(", "))
                        };
                        println!("{}  {}{flags}", b.name, heads.join(" "));
                    }
                }
            }
        }
        BranchCommands::AddHead { branch, rev } => {
            let user = ctx.acting_user(&repo)?;
            let id = resolve(&repo, &rev)?;
            repo.add_head(&branch, &id, &user)?;
            println!("added head {} to {branch}", id.short());
        }
        BranchCommands::RemoveHead { branch, rev } => {
            let user = ctx.acting_user(&repo)?;
            let id = ChangesetId::parse(&rev).or_else(|_| resolve(&repo, &rev))?;
            repo.remove_head(&branch, &id, &user)?;
            println!("removed head {} from {branch}", id.short());
        }
        BranchCommands::MoveHead { branch, from, to } => {
            let user = ctx.acting_user(&repo)?;
            let from = ChangesetId::parse(&from).or_else(|_| resolve(&repo, &from))?;
            let to = resolve(&repo, &to)?;
            repo.move_head(&branch, &from, &to, &user)?;
            println!("moved {branch} from {} to {}", from.short(), to.short());
        }
        BranchCommands::Close { branch } => {
            let user = ctx.acting_user(&repo)?;
            repo.close_branch(&branch, &user)?;
            println!("closed {branch}");
        }
        BranchCommands::Reopen { branch } => {
            let user = ctx.acting_user(&repo)?;
            repo.reopen_branch(&branch, &user)?;
            println!("reopened {branch}");
        }
        BranchCommands::Prune { branch } => {
            let user = ctx.acting_user(&repo)?;
            let pruned = repo.prune_branch(&branch, &user)?;
            println!("pruned {pruned} stale head(s) from {branch}");
        }
    }
    Ok(())
}

fn cmd_heads(ctx: &Ctx, format: &str) -> CliResult<()> {
    let report = ctx.repo()?.heads_report();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            for h in &report {
                let note = if h.available { "" } else { "  (not present here)" };
                println!("{}  {}{note}", h.branch, h.csid.short());
            }
        }
    }
    Ok(())
}

fn lock_state(state: LockState) -> &'static str {
    match state {
        LockState::Open => "open",
        LockState::Waiting => "waiting",
        LockState::Completed => "completed",
        LockState::Violated => "violated",
    }
}

fn print_lock(names: &BTreeMap<UserId, String>, lock: &LockInfo) {
    let marker = if lock.effective { "*" } else { " " };
    println!(
        "{marker} {}  {}  {}  on {}",
        lock.path,
        display_user(names, &lock.holder),
        lock_state(lock.state),
        lock.branch
    );
}

fn cmd_lock(ctx: &Ctx, path: &str, branch: &str) -> CliResult<()> {
    let repo = ctx.repo()?;
    let user = ctx.acting_user(&repo)?;
    let lock = repo.lock(path, &user, branch)?;
    println!("locked {} on {branch} ({})", lock.path, lock.id.short());
    Ok(())
}

fn cmd_unlock(ctx: &Ctx, path: &str) -> CliResult<()> {
    let repo = ctx.repo()?;
    let user = ctx.acting_user(&repo)?;
    repo.unlock(path, &user)?;
    println!("unlocked {path}");
    Ok(())
}

fn cmd_locks(ctx: &Ctx, all: bool, path: Option<&str>, format: &str) -> CliResult<()> {
    let repo = ctx.repo()?;
    let mut locks = if all { repo.all_locks() } else { repo.locks() };
    if let Some(path) = path {
        locks.retain(|l| l.path == path);
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&locks)?),
        _ => {
            if locks.is_empty() {
                println!("no locks");
                return Ok(());
            }
            let names = user_names(&repo);
            for lock in &locks {
                print_lock(&names, lock);
            }
        }
    }
    Ok(())
}

fn cmd_tag(ctx: &Ctx, action: TagCommands) -> CliResult<()> {
    let repo = ctx.repo()?;
    match action {
        TagCommands::Add { name, rev } => {
            let user = ctx.acting_user(&repo)?;
            let id = resolve(&repo, &rev)?;
            repo.add_tag(&name, &id, &user)?;
            println!("tagged {} as {name}", id.short());
        }
        TagCommands::Remove { name } => {
            let user = ctx.acting_user(&repo)?;
            repo.remove_tag(&name, &user)?;
            println!("removed tag {name}");
        }
        TagCommands::List { format } => {
            let tags = repo.tags();
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&tags)?),
                _ => {
                    for t in &tags {
                        println!("{}  {}", t.name, t.csid.short());
                    }
                }
            }
        }
    }
    Ok(())
}

fn cmd_comment(ctx: &Ctx, action: CommentCommands) -> CliResult<()> {
    let repo = ctx.repo()?;
    match action {
        CommentCommands::Add { rev, text } => {
            let user = ctx.acting_user(&repo)?;
            let id = resolve(&repo, &rev)?;
            repo.add_comment(&id, &text, &user)?;
            println!("commented on {}", id.short());
        }
        CommentCommands::List { rev } => {
            let id = resolve(&repo, &rev)?;
            let names = user_names(&repo);
            for c in repo.comments(&id) {
                println!(
                    "{}  {}: {}",
                    c.audit.when.format("%Y-%m-%d %H:%M"),
                    display_user(&names, &c.audit.user),
                    c.text
                );
            }
        }
    }
    Ok(())
}

fn cmd_remote(ctx: &Ctx, action: RemoteCommands) -> CliResult<()> {
    let repo = ctx.repo()?;
    match action {
        RemoteCommands::Add { name, path } => {
            repo.remote_add(&name, &path)?;
            println!("added remote {name} -> {path}");
        }
        RemoteCommands::Remove { name } => {
            repo.remote_remove(&name)?;
            println!("removed remote {name}");
        }
        RemoteCommands::List => {
            for (name, entry) in repo.remote_list() {
                println!("{name}  {}", entry.path);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Push,
    Pull,
}

fn cmd_sync(
    ctx: &Ctx,
    direction: Direction,
    remote: &str,
    branch: Option<String>,
    force: bool,
    format: &str,
) -> CliResult<()> {
    let repo = ctx.repo()?;
    let options = PushOptions {
        branch,
        forced: force,
    };
    let report = match direction {
        Direction::Push => repo.push_remote(remote, &options)?,
        Direction::Pull => repo.pull_remote(remote, &options)?,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            let verb = match direction {
                Direction::Push => "pushed",
                Direction::Pull => "pulled",
            };
            if report.is_noop() {
                println!("{remote} is up to date");
            } else {
                println!(
                    "{verb} {} changeset(s) ({} round trip(s))",
                    report.applied.len(),
                    report.round_trips
                );
            }
            for b in &report.ambiguous {
                println!("  warning: branch {b} now has several heads");
            }
        }
    }
    Ok(())
}

fn cmd_compare(ctx: &Ctx, other: &Path, format: &str) -> CliResult<()> {
    let repo = ctx.repo()?;
    let other = Repository::open(other)?;
    let report = repo.compare_report(&other);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            if report.identical() {
                println!("identical");
                return Ok(());
            }
            for (dag, ids) in &report.only_here {
                println!("{dag}: {} only here", ids.len());
            }
            for (dag, ids) in &report.only_there {
                println!("{dag}: {} only there", ids.len());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_parse_push_flags() {
        let cli = parse(&["veld", "-vv", "push", "origin", "--branch", "master", "--force"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Push {
                remote,
                branch,
                force,
                format,
            } => {
                assert_eq!(remote, "origin");
                assert_eq!(branch.as_deref(), Some("master"));
                assert!(force);
                assert_eq!(format, "human");
            }
            _ => panic!("expected push"),
        }
    }

    #[test]
    fn test_parse_commit_edits() {
        let cli = parse(&[
            "veld", "--user", "alice", "commit", "-m", "edit", "--add", "a.txt=hi", "--add",
            "b.txt=yo", "--rename", "c.txt:d.txt",
        ]);
        assert_eq!(cli.user.as_deref(), Some("alice"));
        match cli.command {
            Commands::Commit {
                message,
                branch,
                add,
                rename,
                ..
            } => {
                assert_eq!(message, "edit");
                assert_eq!(branch, "master");
                assert_eq!(add, vec!["a.txt=hi", "b.txt=yo"]);
                assert_eq!(rename, vec!["c.txt:d.txt"]);
            }
            _ => panic!("expected commit"),
        }
    }

    #[test]
    fn test_parse_rejects_missing_message() {
        assert!(Cli::try_parse_from(["veld", "commit"]).is_err());
        assert!(Cli::try_parse_from(["veld", "lock"]).is_err());
    }

    #[test]
    fn test_split_arg() {
        assert_eq!(split_arg("a.txt=x=y", '=').unwrap(), ("a.txt", "x=y"));
        assert!(split_arg("a.txt", '=').is_err());
    }

    #[test]
    fn test_commands_against_disk_repo() {
        let dir = tempdir().unwrap();
        let ctx = Ctx {
            cwd: dir.path().to_path_buf(),
            user: Some("alice".to_string()),
        };
        run(&ctx, Commands::Init).unwrap();
        run(
            &ctx,
            Commands::User {
                action: UserCommands::Add {
                    name: "alice".to_string(),
                },
            },
        )
        .unwrap();

        let edits = Edits {
            add: vec!["a.txt=one".to_string()],
            ..Default::default()
        };
        cmd_commit(&ctx, "first", "master", &[], &edits).unwrap();
        let edits = Edits {
            modify: vec!["a.txt=two".to_string()],
            ..Default::default()
        };
        cmd_commit(&ctx, "second", "master", &[], &edits).unwrap();
        cmd_lock(&ctx, "a.txt", "master").unwrap();

        let repo = ctx.repo().unwrap();
        assert_eq!(repo.log().len(), 2);
        assert_eq!(repo.branch("master").unwrap().heads.len(), 1);
        assert_eq!(repo.locks().len(), 1);
        cmd_unlock(&ctx, "a.txt").unwrap();
        assert!(ctx.repo().unwrap().locks().is_empty());
    }

    #[test]
    fn test_unknown_acting_user() {
        let dir = tempdir().unwrap();
        let ctx = Ctx {
            cwd: dir.path().to_path_buf(),
            user: Some("nobody".to_string()),
        };
        cmd_init(&ctx.cwd).unwrap();
        let err = cmd_lock(&ctx, "a.txt", "master").unwrap_err();
        assert!(err.downcast_ref::<VeldError>().is_some());
    }
}
