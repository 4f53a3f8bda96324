use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

use tokio::io::AsyncWriteExt;

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Temp file + rename, so readers never observe a partial write.
pub(crate) async fn write_whole(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_sibling(path);

    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(data).await?;
    f.flush().await?;
    drop(f);
    tokio::fs::rename(&tmp, path).await
}

/// Blocking copy with the same all-or-nothing guarantee as [`write_whole`].
pub(crate) fn copy_whole(src: &Path, dst: &Path) -> io::Result<u64> {
    let tmp = tmp_sibling(dst);
    let copied = match std::fs::copy(src, &tmp) {
        Ok(n) => n,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
    };
    std::fs::rename(&tmp, dst)?;
    Ok(copied)
}
