use crate::error::Fault;
use nix::{
    errno::Errno,
    unistd::{access, AccessFlags},
};

/// Check access of `path` for the real identity of this process.
///
/// Any failure, including a missing path, is reported as `EACCES`.
pub(super) fn validate(path: &str, mode: &str) -> Result<(), Fault> {
    let flags = parse_mode(mode)?;

    access(path, flags).map_err(|errno| {
        Fault::os(
            Errno::EACCES,
            format!("Permission denied: '{}' ({})", path, errno.desc()),
        )
    })
}

fn parse_mode(mode: &str) -> Result<AccessFlags, Fault> {
    mode.chars().try_fold(AccessFlags::F_OK, |flags, c| {
        let flag = match c {
            'r' => AccessFlags::R_OK,
            'w' => AccessFlags::W_OK,
            'x' => AccessFlags::X_OK,
            c => return Err(Fault::InvalidArgument(format!("invalid access mode '{}'", c))),
        };
        Ok(flags | flag)
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_mode, validate};
    use crate::error::Fault;
    use nix::unistd::AccessFlags;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("").unwrap(), AccessFlags::F_OK);
        assert_eq!(
            parse_mode("rx").unwrap(),
            AccessFlags::R_OK | AccessFlags::X_OK
        );
        assert!(matches!(parse_mode("rq"), Err(Fault::InvalidArgument(_))));
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();

        validate(path, "rwx").unwrap();
        validate(path, "").unwrap();

        let missing = dir.path().join("missing");
        let fault = validate(missing.to_str().unwrap(), "r").unwrap_err();
        assert_eq!(fault.errno(), Some(libc::EACCES));
    }
}
