//! Translation of stored contacts and configs into watch commands.
//!
//! Watches keep contacts in fixed slots. Single-slot lists (admin numbers,
//! SOS numbers, speed-dial buttons) are written one slot per command; the
//! phonebook and whitelist are written five slots at a time, so changing one
//! entry re-sends its whole page.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::model::{Config, Contact};

/// Contact list kinds a watch knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContactType {
    /// Center (slot 0) and slave (slot 1) numbers allowed to administer the watch.
    Admin,
    Sos,
    Phonebook,
    Whitelist,
    /// Numbers bound to the watch's hardware call buttons.
    Button,
}

impl ContactType {
    /// Number of slots the watch has for this list.
    pub fn slots(self) -> usize {
        self.encoding().slots
    }

    fn encoding(self) -> &'static Encoding {
        match self {
            ContactType::Admin => &ADMIN,
            ContactType::Sos => &SOS,
            ContactType::Phonebook => &PHONEBOOK,
            ContactType::Whitelist => &WHITELIST,
            ContactType::Button => &BUTTON,
        }
    }
}

impl fmt::Display for ContactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContactType::Admin => "ADMIN",
            ContactType::Sos => "SOS",
            ContactType::Phonebook => "PHONEBOOK",
            ContactType::Whitelist => "WHITELIST",
            ContactType::Button => "BUTTON",
        })
    }
}

/// Contact could not be mapped onto a watch slot.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{kind} has {slots} slots, index {index} is out of range")]
    InvalidSlot {
        kind: ContactType,
        index: usize,
        slots: usize,
    },
}

enum Layout {
    /// One command per slot, named by slot index.
    Slot(&'static [&'static str]),
    /// Pages of `PAGE_SIZE` slots, one command name per page.
    Paged(&'static [&'static str]),
}

enum Entry {
    Phone,
    /// `phone,name` with the name as UTF-16BE hex.
    PhoneAndName,
}

struct Encoding {
    slots: usize,
    layout: Layout,
    entry: Entry,
    missing: &'static str,
}

const PAGE_SIZE: usize = 5;

static ADMIN: Encoding = Encoding {
    slots: 2,
    layout: Layout::Slot(&["CENTER", "SLAVE"]),
    entry: Entry::Phone,
    missing: "d",
};

static SOS: Encoding = Encoding {
    slots: 3,
    layout: Layout::Slot(&["SOS1", "SOS2", "SOS3"]),
    entry: Entry::Phone,
    missing: "",
};

static PHONEBOOK: Encoding = Encoding {
    slots: 10,
    layout: Layout::Paged(&["PHB", "PHB2"]),
    entry: Entry::PhoneAndName,
    missing: ",",
};

static WHITELIST: Encoding = Encoding {
    slots: 10,
    layout: Layout::Paged(&["WHITELIST1", "WHITELIST2"]),
    entry: Entry::Phone,
    missing: ",",
};

static BUTTON: Encoding = Encoding {
    slots: 2,
    layout: Layout::Slot(&["TEL1", "TEL2"]),
    entry: Entry::Phone,
    missing: "",
};

/// Build the command that writes slot `index` of list `kind`.
///
/// `contacts` is the stored state of the list after the change; slots with no
/// stored contact are sent as the list's placeholder, which clears them on
/// the watch.
pub fn encode_contact(
    kind: ContactType,
    index: usize,
    contacts: &[Contact],
) -> Result<Command, EncodeError> {
    check_slot(kind, index)?;
    let encoding = kind.encoding();

    let slot = |i: usize| -> String {
        contacts
            .iter()
            .find(|contact| contact.kind == kind && contact.index == i)
            .map(|contact| match encoding.entry {
                Entry::Phone => contact.phone.clone(),
                Entry::PhoneAndName => format!(
                    "{},{}",
                    contact.phone,
                    to_utf16_hex(contact.name.as_deref().unwrap_or_default())
                ),
            })
            .unwrap_or_else(|| encoding.missing.to_string())
    };

    let command = match encoding.layout {
        Layout::Slot(names) => Command::new(names[index], vec![slot(index)]),
        Layout::Paged(names) => {
            let page = index / PAGE_SIZE;
            let first = page * PAGE_SIZE;
            Command::new(names[page], (first..first + PAGE_SIZE).map(slot).collect())
        }
    };
    Ok(command)
}

/// Reject an index the watch has no slot for.
pub fn check_slot(kind: ContactType, index: usize) -> Result<(), EncodeError> {
    let slots = kind.slots();
    if index >= slots {
        return Err(EncodeError::InvalidSlot { kind, index, slots });
    }
    Ok(())
}

/// Build the command that sets a configuration parameter.
pub fn encode_config(config: &Config) -> Command {
    Command::new(config.parameter.clone(), vec![config.value.clone()])
}

/// Encode text as uppercase hex of its UTF-16 big-endian code units.
pub fn to_utf16_hex(text: &str) -> String {
    let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_be_bytes).collect();
    hex::encode_upper(bytes)
}
