use std::path::{Path, PathBuf};
use std::sync::Arc;

use similar_asserts::assert_eq;
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;

use skiff::{
    client::{ClientError, HelperClient},
    helper::{self, SocketGuard},
    image::Image,
    index,
    userns::{helper_command, HelperProcess},
};

fn append(builder: &mut Builder<&mut Vec<u8>>, path: &str, entry_type: EntryType, data: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_mode(if entry_type == EntryType::Directory {
        0o755
    } else {
        0o644
    });
    header.set_mtime(1_600_000_000);
    header.set_size(data.len() as u64);
    header.set_entry_type(entry_type);
    builder.append_data(&mut header, path, data).unwrap();
}

fn layer(entries: &[(&str, EntryType, &[u8])]) -> Vec<u8> {
    let mut data = vec![];
    {
        let mut builder = Builder::new(&mut data);
        for &(path, entry_type, content) in entries {
            append(&mut builder, path, entry_type, content);
        }
        builder.finish().unwrap();
    }
    data
}

/// Two layers; the upper one is cut short in the middle of its second header.
fn write_layers(dir: &Path) -> String {
    let lower = layer(&[
        ("etc", EntryType::Directory, b""),
        ("etc/motd", EntryType::Regular, b"hello from the lower layer\n"),
        ("etc/os-release", EntryType::Regular, b"ID=skiff\n"),
        ("usr/bin/tool", EntryType::Regular, &[7u8; 3000]),
    ]);
    let mut upper = layer(&[
        ("etc/motd", EntryType::Regular, b"upper\n"),
        ("var/lost", EntryType::Regular, b"never indexed"),
    ]);
    upper.truncate(512 + 512 + 200);

    let lower_path = dir.join("lower.tar");
    let upper_path = dir.join("upper.tar");
    std::fs::write(&lower_path, lower).unwrap();
    std::fs::write(&upper_path, upper).unwrap();
    format!("tar:{},{}", lower_path.display(), upper_path.display())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_over_socket() {
    let dir = TempDir::new().unwrap();
    let imgref = write_layers(dir.path());
    let socket = dir.path().join("helper.sock");

    let image = Image::resolve(&imgref).unwrap();
    let index = index::build(&image).await;
    let (listener, guard) = SocketGuard::bind(&socket).unwrap();

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(helper::serve(
        listener,
        Arc::new(index),
        Arc::new(image),
        async move {
            let _ = stopped.await;
        },
    ));

    let client_socket = socket.clone();
    tokio::task::spawn_blocking(move || {
        let client = HelperClient::connect(&client_socket).unwrap();

        let index = client.fetch_index().unwrap();
        let paths: Vec<&str> = index.records().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "/etc",
                "/etc/motd",
                "/etc/os-release",
                "/usr/bin/tool",
            ]
        );
        assert_eq!(index.get("/etc/motd").unwrap().size, 6);

        assert_eq!(client.read("/etc/motd", 0, 0).unwrap(), b"upper\n");
        assert_eq!(client.read("/etc/os-release", 3, 5).unwrap(), b"skiff");
        assert_eq!(client.read("/usr/bin/tool", 2990, 4096).unwrap(), [7u8; 10]);
        assert!(client.read("/etc/os-release", 100, 10).unwrap().is_empty());

        let err = client.read("/var/lost", 0, 0).unwrap_err();
        assert!(matches!(err, ClientError::Helper(msg) if msg.contains("/var/lost")));
        assert!(matches!(
            client.read("/etc", 0, 0),
            Err(ClientError::Helper(_))
        ));

        // a second, independent session
        let other = HelperClient::connect(&client_socket).unwrap();
        assert_eq!(other.read("/etc/motd", 1, 2).unwrap(), b"pp");
        other.end_session().unwrap();

        // the first session is still usable
        assert_eq!(client.read("/etc/motd", 0, 1).unwrap(), b"u");
        client.end_session().unwrap();
    })
    .await
    .unwrap();

    stop.send(()).unwrap();
    server.await.unwrap();
    drop(guard);
    assert!(!socket.exists());
}

fn skiff_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_skiff"))
}

#[test]
fn test_helper_process() {
    let dir = TempDir::new().unwrap();
    let imgref = write_layers(dir.path());
    let socket = dir.path().join("helper.sock");

    let command = helper_command(&skiff_binary(), &imgref, &socket, false);
    let mut helper = HelperProcess::spawn(command).unwrap();
    helper.wait_ready().unwrap();
    assert!(socket.exists());

    let client = HelperClient::connect(&socket).unwrap();
    assert_eq!(client.fetch_index().unwrap().len(), 4);
    assert_eq!(
        client.read("/etc/motd", 0, 0).unwrap(),
        b"upper\n".to_vec()
    );
    client.end_session().unwrap();

    let status = helper.terminate().unwrap();
    assert!(status.success(), "{status}");
    assert!(!socket.exists());
}

#[test]
fn test_helper_process_bad_image() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("helper.sock");
    let imgref = format!("oci:{}", dir.path().join("missing").display());

    let command = helper_command(&skiff_binary(), &imgref, &socket, false);
    let mut helper = HelperProcess::spawn(command).unwrap();
    assert!(helper.wait_ready().is_err());
    assert!(!helper.terminate().unwrap().success());
    assert!(!socket.exists());
}

fn skiff_output(args: &[&str]) -> std::process::Output {
    std::process::Command::new(skiff_binary())
        .args(args)
        .output()
        .unwrap()
}

fn skiff(args: &[&str]) -> String {
    let output = skiff_output(args);
    assert!(output.status.success(), "{output:?}");
    String::from_utf8(output.stdout).unwrap()
}

/// First 12 hex characters of a file's sha256.
fn short_sha256(path: &Path) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(std::fs::read(path).unwrap()))[..12].to_string()
}

#[test]
fn test_reports() {
    let dir = TempDir::new().unwrap();
    let imgref = write_layers(dir.path());
    let lower = format!("tar:{}", dir.path().join("lower.tar").display());
    let lower_id = short_sha256(&dir.path().join("lower.tar"));
    let upper_id = short_sha256(&dir.path().join("upper.tar"));

    assert_eq!(
        skiff(&["top", &imgref, "-n", "2"]),
        format!(
            "FILE PATH        SIZE  DIFF ID\n\
             /usr/bin/tool    3000  {lower_id}\n\
             /etc/os-release  9     {lower_id}\n"
        )
    );
    // the replaced /etc/motd comes from the cut-short upper layer
    assert_eq!(
        skiff(&["top", &imgref, "-l", &upper_id[..6]]),
        format!("FILE PATH  SIZE  DIFF ID\n/etc/motd  6     {upper_id}\n")
    );
    assert_eq!(
        skiff(&["top", &imgref, "--diff-id", &lower_id, "-n", "1"]),
        format!("FILE PATH      SIZE  DIFF ID\n/usr/bin/tool  3000  {lower_id}\n")
    );
    let output = skiff_output(&["top", &imgref, "--layer", "0000"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("diff ID 0000 not found in image"));

    assert_eq!(
        skiff(&["diff", &lower, &imgref]),
        "Change    Size Diff  Path\n\
         MODIFIED  -21        /etc/motd\n"
    );
    assert_eq!(
        skiff(&["diff", &imgref, &imgref]),
        "No differences found between the images.\n"
    );

    let layers = skiff(&["layers", &imgref, "--full-digest"]);
    let lines: Vec<&str> = layers.lines().collect();
    assert_eq!(lines.len(), 3);
    // tarballs carry no configuration to take diff IDs from
    assert!(lines[0].starts_with("Compressed Digest"));
    assert!(lines[1].starts_with("sha256:"));
    assert!(lines[2].ends_with(&(512 + 512 + 200).to_string()));
}
