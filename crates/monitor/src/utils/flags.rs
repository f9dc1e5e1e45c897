//! A small library to parse command-line and environmental flags.
//!
//! Flags are grouped by a marker type and registered before `main` runs through
//! [`define_flag!`](crate::define_flag). A group is parsed exactly once, either
//! with or without a prefix:
//!
//! ```text
//! --monitor:spin-limit=2000   MONITOR_SPIN_LIMIT=2000
//! --monitor:no-deflation-thread
//! ```

use std::{
    any::TypeId,
    borrow::Cow,
    fmt::Write,
    sync::atomic::{AtomicBool, Ordering},
};

use log::warn;
use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};
use thiserror::Error;

#[doc(hidden)]
pub use ctor::ctor;
#[doc(hidden)]
pub use paste;

/// A value that can be stored in a flag.
pub trait FlagValue: Clone + Send + Sync + 'static {
    /// Boolean flags may be given without a value and negated with `no-`.
    const IS_BOOL: bool = false;

    fn parse_flag(argument: &str) -> Option<Self>;
}

impl FlagValue for bool {
    const IS_BOOL: bool = true;

    fn parse_flag(argument: &str) -> Option<Self> {
        match argument {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

fn split_radix(argument: &str) -> (&str, u32) {
    if let Some(hex) = argument
        .strip_prefix("0x")
        .or_else(|| argument.strip_prefix("0X"))
    {
        (hex, 16)
    } else if argument.len() > 1 && argument.starts_with('0') {
        (&argument[1..], 8)
    } else {
        (argument, 10)
    }
}

macro_rules! integer_flag_value {
    ($($t: ty),*) => {
        $(
            impl FlagValue for $t {
                fn parse_flag(argument: &str) -> Option<Self> {
                    let argument = argument.replace('_', "");
                    let (digits, radix) = split_radix(&argument);
                    <$t>::from_str_radix(digits, radix).ok()
                }
            }
        )*
    };
}

integer_flag_value!(usize, isize, u32, i32, u64, i64);

impl FlagValue for f64 {
    fn parse_flag(argument: &str) -> Option<Self> {
        argument.parse().ok()
    }
}

impl FlagValue for String {
    fn parse_flag(argument: &str) -> Option<Self> {
        Some(argument.to_owned())
    }
}

/// Storage behind a single flag. Reads fall back to the default until the flag
/// is set from the command line, the environment or a setter.
pub struct FlagCell<T> {
    value: RwLock<Option<T>>,
    is_set: AtomicBool,
}

impl<T: FlagValue> FlagCell<T> {
    pub const fn new() -> Self {
        Self {
            value: const_rwlock(None),
            is_set: AtomicBool::new(false),
        }
    }

    pub fn get_or(&self, default: impl FnOnce() -> T) -> T {
        match &*self.value.read() {
            Some(value) => value.clone(),
            None => default(),
        }
    }

    pub fn set(&self, value: T) {
        *self.value.write() = Some(value);
    }

    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Relaxed)
    }

    /// Returns false when `argument` is not a valid value for this flag.
    pub fn set_from_str(&self, argument: &str) -> bool {
        match T::parse_flag(argument) {
            Some(value) => {
                self.set(value);
                self.is_set.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

impl<T: FlagValue> Default for FlagCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub type FlagSetter = fn(&str) -> bool;
pub type FlagIsSet = fn() -> bool;

#[derive(Clone, Copy)]
struct Flag {
    name: &'static str,
    comment: &'static str,
    short: Option<&'static str>,
    is_bool: bool,
    setter: FlagSetter,
    is_set: FlagIsSet,
}

struct FlagGroup {
    type_id: TypeId,
    type_name: &'static str,
    flags: Vec<Flag>,
    initialized: bool,
}

/// Every registered group, keyed by the marker type. Filled by constructors
/// that run before `main`, so it must be usable without lazy initialization.
static FLAGS: Mutex<Vec<FlagGroup>> = const_mutex(Vec::new());

/// Registers a flag of group `T`.
#[doc(hidden)]
pub fn register<T: 'static>(
    name: &'static str,
    comment: &'static str,
    short: Option<&'static str>,
    is_bool: bool,
    setter: FlagSetter,
    is_set: FlagIsSet,
) {
    let mut groups = FLAGS.lock();
    let type_id = TypeId::of::<T>();

    let index = match groups.iter().position(|group| group.type_id == type_id) {
        Some(index) => index,
        None => {
            groups.push(FlagGroup {
                type_id,
                type_name: std::any::type_name::<T>(),
                flags: Vec::new(),
                initialized: false,
            });
            groups.len() - 1
        }
    };

    let group = &mut groups[index];
    if group.flags.iter().any(|flag| flag.name == name) {
        return;
    }

    group.flags.push(Flag {
        name,
        comment,
        short,
        is_bool,
        setter,
        is_set,
    });
}

pub struct FlagsOf<T>(std::marker::PhantomData<T>);

impl<T: 'static> FlagsOf<T> {
    fn snapshot() -> Option<Vec<Flag>> {
        let groups = FLAGS.lock();
        groups
            .iter()
            .find(|group| group.type_id == TypeId::of::<T>())
            .map(|group| group.flags.clone())
    }

    pub fn is_set(name: &str) -> bool {
        Self::snapshot()
            .and_then(|flags| flags.into_iter().find(|flag| flag.name == name))
            .map_or(false, |flag| (flag.is_set)())
    }

    pub fn is_initialized() -> bool {
        FLAGS
            .lock()
            .iter()
            .find(|group| group.type_id == TypeId::of::<T>())
            .map_or(false, |group| group.initialized)
    }

    /// Human readable listing of the group, one flag per line.
    pub fn describe(prefix: Option<&str>) -> String {
        let mut out = String::new();
        let Some(mut flags) = Self::snapshot() else {
            return out;
        };
        flags.sort_by(|a, b| a.name.cmp(b.name));

        let cli_prefix = cli_prefix(prefix, "--");
        for flag in flags {
            let name = flag.name.replace('_', "-");
            let _ = match flag.short {
                Some(short) => writeln!(out, "  {}{} ({}): {}", cli_prefix, name, short, flag.comment),
                None => writeln!(out, "  {}{}: {}", cli_prefix, name, flag.comment),
            };
        }
        out
    }
}

fn cli_prefix<'a>(prefix: Option<&str>, dashes: &'a str) -> Cow<'a, str> {
    prefix
        .map(|prefix| Cow::Owned(format!("{}{}:", dashes, prefix)))
        .unwrap_or(Cow::Borrowed(dashes))
}

fn apply(flag: &Flag, name: &str, argument: &str) {
    if !(flag.setter)(argument) {
        warn!(
            "Ignoring flag: {} is an invalid value for flag {}",
            argument, name
        );
    }
}

fn parse_option(flags: &[Flag], option: &str, short: bool) -> Result<(), FlagError> {
    let (name, argument) = match option.split_once('=') {
        Some((name, argument)) => (name, Some(argument)),
        None => (option, None),
    };
    let name = name.replace('-', "_");

    let lookup = |name: &str| {
        flags.iter().find(|flag| {
            if short {
                flag.short == Some(name)
            } else {
                flag.name == name
            }
        })
    };

    if let Some(flag) = lookup(&name) {
        let argument = match argument {
            Some(argument) => argument,
            None if flag.is_bool => "true",
            None => {
                warn!("Ignoring flag: {} requires a value", name);
                return Ok(());
            }
        };
        apply(flag, &name, argument);
        return Ok(());
    }

    if argument.is_none() {
        if let Some(negated) = name.strip_prefix("no_") {
            if let Some(flag) = lookup(negated).filter(|flag| flag.is_bool) {
                apply(flag, negated, "false");
                return Ok(());
            }
        }
    }

    Err(FlagError::FlagNotFound(name))
}

fn process_command_line_flags(
    flags: &[Flag],
    prefix: Option<&str>,
    args: impl Iterator<Item = String>,
) -> Result<(), FlagError> {
    let long = cli_prefix(prefix, "--");
    let short = cli_prefix(prefix, "-");

    for arg in args {
        if let Some(option) = arg.strip_prefix(long.as_ref()).filter(|o| !o.is_empty()) {
            parse_option(flags, option, false)?;
        } else if let Some(option) = arg.strip_prefix(short.as_ref()).filter(|o| !o.is_empty()) {
            parse_option(flags, option, true)?;
        }
    }

    Ok(())
}

fn process_environmental_vars(
    flags: &[Flag],
    prefix: Option<&str>,
    vars: impl Iterator<Item = (String, String)>,
) {
    let env_prefix = prefix
        .map(|prefix| format!("{}_", prefix.to_uppercase()))
        .unwrap_or_default();

    for (key, argument) in vars {
        let Some(name) = key.strip_prefix(env_prefix.as_str()) else {
            continue;
        };
        let name = name.to_lowercase();
        if let Some(flag) = flags.iter().find(|flag| flag.name == name) {
            apply(flag, &name, &argument);
        }
    }
}

fn parse_impl<T: 'static>(
    prefix: Option<&str>,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    let flags = {
        let groups = FLAGS.lock();
        let group = groups
            .iter()
            .find(|group| group.type_id == TypeId::of::<T>())
            .ok_or(FlagError::NoFlags(std::any::type_name::<T>()))?;
        if group.initialized {
            return Err(FlagError::FlagsAlreadyInitialized(group.type_name));
        }
        group.flags.clone()
    };

    process_environmental_vars(&flags, prefix, env);
    process_command_line_flags(&flags, prefix, args)?;

    if let Some(group) = FLAGS
        .lock()
        .iter_mut()
        .find(|group| group.type_id == TypeId::of::<T>())
    {
        group.initialized = true;
    }
    Ok(())
}

pub fn parse<T: 'static>(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    parse_impl::<T>(None, args, env)
}

pub fn parse_with_prefix<T: 'static>(
    prefix: &str,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    parse_impl::<T>(Some(prefix), args, env)
}

/// Defines a flag of group `$of`.
///
/// Generates `<of>_<name>()` returning the current value,
/// `<of>_<name>_default()`, `set_<of>_<name>()` and `is_<of>_<name>_set()`.
#[macro_export]
macro_rules! define_flag {
    (@define $of: ident => $typ: ty, $name: ident, $short: expr, $default_value: expr, $comment: literal) => {
        $crate::utils::flags::paste::paste! {
            static [<$of:upper _FLAG_ $name:upper>]: $crate::utils::flags::FlagCell<$typ> =
                $crate::utils::flags::FlagCell::new();

            #[doc(hidden)]
            #[ctor::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                $crate::utils::flags::register::<$of>(
                    stringify!($name),
                    $comment,
                    $short,
                    <$typ as $crate::utils::flags::FlagValue>::IS_BOOL,
                    |argument| [<$of:upper _FLAG_ $name:upper>].set_from_str(argument),
                    || [<$of:upper _FLAG_ $name:upper>].is_set(),
                );
            }

            #[doc = $comment]
            pub fn [<$of:lower _ $name>]() -> $typ {
                [<$of:upper _FLAG_ $name:upper>].get_or([<$of:lower _ $name _default>])
            }

            #[allow(dead_code)]
            pub fn [<$of:lower _ $name _default>]() -> $typ {
                $default_value
            }

            #[allow(dead_code)]
            pub fn [<set_ $of:lower _ $name>]($name: $typ) {
                [<$of:upper _FLAG_ $name:upper>].set($name)
            }

            #[allow(dead_code)]
            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                [<$of:upper _FLAG_ $name:upper>].is_set()
            }
        }
    };

    ($of: ident => $typ: ty, $name: ident, $short: literal, $default_value: expr, $comment: literal) => {
        $crate::define_flag!(@define $of => $typ, $name, Some($short), $default_value, $comment);
    };

    ($of: ident => $typ: ty, $name: ident, $default_value: expr, $comment: literal) => {
        $crate::define_flag!(@define $of => $typ, $name, None, $default_value, $comment);
    };
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("unknown flag `{0}`")]
    FlagNotFound(String),
    #[error("flags of `{0}` were already parsed")]
    FlagsAlreadyInitialized(&'static str),
    #[error("no flags are registered for `{0}`")]
    NoFlags(&'static str),
}
