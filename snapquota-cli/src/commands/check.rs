//! Node environment check

use anyhow::Result;
use std::path::Path;
use snapquota_core::config::ContainerdConfig;
use snapquota_prjquota::{MountTable, BACKING_DEVICE_NODE};

use crate::cli::CheckArgs;

/// Execute the environment check
pub async fn execute(args: CheckArgs) -> Result<()> {
    let containerd = ContainerdConfig::from(args.containerd);

    println!("\nsnapquota environment check\n");
    println!("{:-<60}", "");

    check_project_quota(&containerd.base_path)?;
    check_permissions();
    check_containerd(&containerd);
    check_socket("host plugin socket", &args.host_socket);

    println!("{:-<60}", "");
    println!("\n✅ Project quota is available\n");

    Ok(())
}

/// The backing filesystem must be mounted with project quota
fn check_project_quota(base_path: &Path) -> Result<()> {
    print!("Checking project quota on {}... ", base_path.display());

    let table = MountTable::read()?;
    let resolved = std::fs::canonicalize(base_path).unwrap_or_else(|_| base_path.to_path_buf());
    let Some(entry) = table.containing(&resolved) else {
        println!("❌ NO MOUNT");
        anyhow::bail!("mount point not found for path: {}", resolved.display());
    };

    if !entry.has_project_quota() {
        println!("❌ DISABLED");
        println!("   Mount: {} ({})", entry.target.display(), entry.fstype);
        println!("   Options: {}", entry.options.join(","));
        anyhow::bail!(
            "Project quota is not enabled on {}\n\
             \n\
             Mount an xfs filesystem with prjquota, or an ext4 filesystem\n\
             with the project feature and prjquota.",
            entry.target.display()
        );
    }

    println!("✅ OK ({} on {})", entry.fstype, entry.target.display());
    Ok(())
}

fn check_permissions() {
    print!("Checking permissions... ");

    if nix::unistd::geteuid().is_root() {
        println!("✅ OK (root)");
    } else {
        println!("⚠️  NOT ROOT");
        println!("   Setting project ids and limits needs CAP_SYS_ADMIN");
    }
}

fn check_containerd(containerd: &ContainerdConfig) {
    check_socket("containerd socket", &containerd.socket);

    print!("Checking overlay snapshots... ");
    let snapshots = containerd.snapshots_dir();
    if snapshots.is_dir() {
        println!("✅ OK ({})", snapshots.display());
    } else {
        println!("⚠️  MISSING");
        println!("   Not found: {}", snapshots.display());
    }

    print!("Checking quota device node... ");
    let node = containerd.root_dir.join(BACKING_DEVICE_NODE);
    if node.exists() {
        println!("✅ OK ({})", node.display());
    } else {
        println!("⚠️  NOT CREATED");
        println!("   The daemon creates {} at startup", node.display());
    }
}

fn check_socket(what: &str, path: &Path) {
    use std::os::unix::fs::FileTypeExt;

    print!("Checking {what}... ");
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => println!("✅ OK ({})", path.display()),
        Ok(_) => {
            println!("⚠️  NOT A SOCKET");
            println!("   {} exists but is not a socket", path.display());
        }
        Err(e) => {
            println!("⚠️  UNAVAILABLE");
            println!("   {}: {e}", path.display());
        }
    }
}
