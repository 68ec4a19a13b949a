//! Path display helpers.

use std::path::Path;

/// Shorten a path for messages: relative to the working directory when it
/// lies below it, `~`-prefixed when it lies below the home directory.
pub fn pretty_path(path: &Path) -> String {
    let cwd = std::env::current_dir().ok();
    let home = dirs::home_dir();
    shorten(path, cwd.as_deref(), home.as_deref())
}

fn shorten(path: &Path, cwd: Option<&Path>, home: Option<&Path>) -> String {
    if let Some(relative) = cwd.and_then(|cwd| path.strip_prefix(cwd).ok()) {
        if !relative.as_os_str().is_empty() {
            return relative.display().to_string();
        }
    }
    if let Some(relative) = home.and_then(|home| path.strip_prefix(home).ok()) {
        return Path::new("~").join(relative).display().to_string();
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorten() {
        let cwd = Path::new("/home/ada/project");
        let home = Path::new("/home/ada");

        assert_eq!(
            shorten(Path::new("/home/ada/project/src/a.php"), Some(cwd), Some(home)),
            "src/a.php"
        );
        assert_eq!(shorten(Path::new("/home/ada/lib/b.php"), Some(cwd), Some(home)), "~/lib/b.php");
        assert_eq!(shorten(Path::new("/etc/c.php"), Some(cwd), Some(home)), "/etc/c.php");
        assert_eq!(shorten(Path::new("/etc/c.php"), None, None), "/etc/c.php");
    }
}
