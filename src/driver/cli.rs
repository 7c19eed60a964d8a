//! ld-compatible command-line parsing.
//!
//! A flat `while` loop with a `match` per argument, no parser library.
//! Positional options (`--whole-archive`, `--as-needed`, `-Bstatic`, group
//! brackets) mutate builder state so they attach to the inputs that follow
//! them, exactly like the classic linkers they imitate.

use std::path::{Path, PathBuf};

use crate::config::{Endianness, OutputType};
use crate::error::LinkError;
use crate::input::InputType;

use super::Driver;

impl Driver {
    /// Parse arguments (excluding argv[0]). Returns `Ok(true)` when a query
    /// flag handled everything and the process should exit successfully.
    pub fn parse_args(&mut self, args: &[String]) -> Result<bool, LinkError> {
        let mut it = args.iter().peekable();
        while let Some(arg) = it.next() {
            let mut take_value = |flag: &str| -> Result<String, LinkError> {
                it.next()
                    .cloned()
                    .ok_or_else(|| LinkError::Config(format!("{} needs an argument", flag)))
            };

            match arg.as_str() {
                "--version" | "-v" => {
                    println!("ccld {}", env!("CARGO_PKG_VERSION"));
                    return Ok(true);
                }
                "--help" => {
                    print_help();
                    return Ok(true);
                }

                "-o" => self.config.output = PathBuf::from(take_value("-o")?),
                "-e" | "--entry" => self.config.entry = take_value("-e")?,
                "-shared" | "--shared" | "-Bshareable" => {
                    self.config.output_type = OutputType::DynObj;
                }
                "-r" | "--relocatable" | "-i" => {
                    self.config.output_type = OutputType::Relocatable;
                }
                "-Bsymbolic" => self.config.bsymbolic = true,
                "-pie" | "--pic-executable" => self.config.pic = true,
                "-soname" | "-h" => self.config.soname = Some(take_value("-soname")?),
                "--allow-multiple-definition" => {
                    self.config.allow_multiple_definition = true;
                }
                "-EL" => self.config.endian = Endianness::Little,
                "-EB" => self.config.endian = Endianness::Big,
                "--dynamic-linker" | "-I" => self.config.interpreter = take_value("-I")?,

                "-L" => {
                    let dir = take_value("-L")?;
                    self.config.search_dirs.push(PathBuf::from(dir));
                }
                "-l" => {
                    let spec = take_value("-l")?;
                    self.add_namespec(&spec)?;
                }

                "--start-group" | "-(" => self.builder.enter_group(),
                "--end-group" | "-)" => self.builder.leave_group()?,
                "--whole-archive" => self.builder.set_whole_archive(true),
                "--no-whole-archive" => self.builder.set_whole_archive(false),
                "--as-needed" => self.builder.set_as_needed(true),
                "--no-as-needed" => self.builder.set_as_needed(false),
                "--add-needed" | "--copy-dt-needed-entries" => self.builder.set_add_needed(true),
                "--no-add-needed" | "--no-copy-dt-needed-entries" => {
                    self.builder.set_add_needed(false)
                }
                "-Bstatic" | "-static" | "-dn" | "-non_shared" => self.builder.set_static(true),
                "-Bdynamic" | "-dy" | "-call_shared" => self.builder.set_static(false),

                // -z keywords other than muldefs are accepted and ignored,
                // matching what build systems expect from an ld.
                "-z" => {
                    let kw = take_value("-z")?;
                    if kw == "muldefs" {
                        self.config.allow_multiple_definition = true;
                    }
                }

                _ if arg.starts_with("--sysroot=") => {
                    self.config.sysroot = Some(PathBuf::from(&arg["--sysroot=".len()..]));
                }
                _ if arg.starts_with("-L") => {
                    self.config.search_dirs.push(PathBuf::from(&arg[2..]));
                }
                _ if arg.starts_with("-l") => {
                    let spec = arg[2..].to_string();
                    self.add_namespec(&spec)?;
                }
                _ if arg.starts_with("-o") && arg.len() > 2 => {
                    self.config.output = PathBuf::from(&arg[2..]);
                }
                _ if arg.starts_with("-soname=") => {
                    self.config.soname = Some(arg["-soname=".len()..].to_string());
                }
                _ if arg.starts_with('-') => {
                    log::debug!("ignoring unsupported option {}", arg);
                }

                path => {
                    self.builder.add_file(Path::new(path), InputType::Unknown);
                    self.inputs_seen = true;
                }
            }
        }
        Ok(false)
    }

    fn add_namespec(&mut self, spec: &str) -> Result<(), LinkError> {
        self.builder.add_namespec(spec, &self.config)?;
        self.inputs_seen = true;
        Ok(())
    }
}

fn print_help() {
    println!("usage: ccld [options] file...");
    println!("  -o FILE               write output to FILE");
    println!("  -l NAMESPEC           link against libNAMESPEC.so or .a");
    println!("  -L DIR                add DIR to the library search path");
    println!("  -e SYMBOL             set the entry symbol");
    println!("  -shared               build a shared object");
    println!("  -soname NAME          set DT_SONAME for shared objects");
    println!("  -Bstatic / -Bdynamic  restrict or allow shared libraries for -l");
    println!("  -Bsymbolic            bind references locally in shared objects");
    println!("  --start-group/--end-group      bracket archives for re-iteration");
    println!("  --whole-archive/--no-whole-archive");
    println!("  --as-needed/--no-as-needed     control DT_NEEDED emission");
    println!("  --allow-multiple-definition    keep the first of duplicate symbols");
    println!("  --sysroot=DIR         prefix absolute search paths with DIR");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Driver {
        let mut driver = Driver::new();
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        driver.parse_args(&owned).unwrap();
        driver
    }

    #[test]
    fn test_basic_flags() {
        let d = parse(&["-o", "out.elf", "-e", "reset", "crt0.o", "main.o"]);
        assert_eq!(d.config.output, PathBuf::from("out.elf"));
        assert_eq!(d.config.entry, "reset");
        assert_eq!(d.builder.inputs.len(), 2);
        assert!(d.inputs_seen);
    }

    #[test]
    fn test_shared_and_soname() {
        let d = parse(&["-shared", "-soname", "libx.so.1", "-Bsymbolic", "x.o"]);
        assert_eq!(d.config.output_type, OutputType::DynObj);
        assert_eq!(d.config.soname.as_deref(), Some("libx.so.1"));
        assert!(d.config.bsymbolic);
    }

    #[test]
    fn test_positional_state_and_groups() {
        let d = parse(&[
            "a.o",
            "--whole-archive",
            "--start-group",
            "libx.a",
            "--end-group",
            "--no-whole-archive",
            "b.o",
        ]);
        assert!(d.builder.inputs[1].attrs.whole_archive);
        assert!(!d.builder.inputs[2].attrs.whole_archive);
    }

    #[test]
    fn test_unbalanced_group_errors() {
        let mut driver = Driver::new();
        let args = vec!["--end-group".to_string()];
        assert!(driver.parse_args(&args).is_err());
    }

    #[test]
    fn test_attached_short_options() {
        let d = parse(&["-L/usr/arm/lib", "-ofoo.elf"]);
        assert_eq!(d.config.search_dirs, vec![PathBuf::from("/usr/arm/lib")]);
        assert_eq!(d.config.output, PathBuf::from("foo.elf"));
    }

    #[test]
    fn test_z_keywords() {
        let d = parse(&["-z", "muldefs", "a.o"]);
        assert!(d.config.allow_multiple_definition);
        let d = parse(&["-z", "noexecstack", "a.o"]);
        assert!(!d.config.allow_multiple_definition);
    }
}
