use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use skiff::{
    helper,
    image::Image,
    mount::{self, MountConfig},
    report,
    userns::Unshare,
};

/// Inspect and lazily mount layered container images
#[derive(Debug, Parser)]
#[clap(name = "skiff", version)]
pub struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Mounts the merged layers of an image read-only, fetching file contents on demand
    Mount {
        /// `oci:DIR[:TAG]`, `tar:FILE[,FILE...]` or an OCI layout directory
        image: String,
        mountpoint: PathBuf,
        /// let other users access the mount
        #[clap(long)]
        allow_other: bool,
        /// run the helper inside `podman unshare`
        #[clap(long, value_enum, default_value_t = Unshare::Auto)]
        unshare: Unshare,
        /// the binary to run as the helper
        #[clap(long, env = "SKIFF_HELPER_BINARY", default_value = "/proc/self/exe")]
        helper_binary: PathBuf,
    },
    /// Lists the layers of an image
    Layers {
        image: String,
        /// print complete digests
        #[clap(long)]
        full_digest: bool,
    },
    /// Shows the largest files of an image
    Top {
        image: String,
        /// how many files to show
        #[clap(short, default_value_t = 10)]
        n: usize,
        /// only count files from the layer with this diff ID or diff ID prefix
        #[clap(short = 'l', long = "layer", visible_alias = "diff-id")]
        layer: Vec<String>,
        #[clap(long)]
        human_readable: bool,
    },
    /// Compares the files of two images
    Diff {
        image1: String,
        image2: String,
        #[clap(long)]
        human_readable: bool,
    },
    /// Serves layer contents to a mount (internal)
    #[clap(hide = true)]
    MountHelper { image: String, socket: PathBuf },
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Building tokio runtime")?;
    Ok(runtime.block_on(future))
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    let mut stdout = std::io::stdout();

    match args.cmd {
        Command::Mount {
            image,
            mountpoint,
            allow_other,
            unshare,
            helper_binary,
        } => mount::run(MountConfig {
            image,
            mountpoint,
            allow_other,
            unshare,
            helper_binary,
        })?,
        Command::Layers { image, full_digest } => {
            let image =
                Image::resolve(&image).with_context(|| format!("Resolving image {image}"))?;
            report::write_layers(&mut stdout, &image, full_digest)?;
        }
        Command::Top {
            image,
            n,
            layer,
            human_readable,
        } => {
            let image =
                Image::resolve(&image).with_context(|| format!("Resolving image {image}"))?;
            let (files, diff_ids) = block_on(async {
                let diff_ids = report::layer_diff_ids(&image).await?;
                anyhow::Ok((report::layer_files(&image).await, diff_ids))
            })??;
            let layers = report::select_layers(&diff_ids, &layer)?;
            let files = report::top_files(files, n, &layers);
            report::write_top(&mut stdout, &files, &diff_ids, human_readable)?;
        }
        Command::Diff {
            image1,
            image2,
            human_readable,
        } => {
            let (old, new) = block_on(async {
                tokio::try_join!(report::index_image(&image1), report::index_image(&image2))
            })??;
            report::write_diff(&mut stdout, &report::diff(&old, &new), human_readable)?;
        }
        Command::MountHelper { image, socket } => helper::run(&image, &socket)?,
    }

    stdout.flush().context("Writing to stdout")?;
    Ok(())
}
