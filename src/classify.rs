// MIT License

//! Address classification.
//!
//! Telenot panels report everything through a flat 16-bit address space.
//! The [`AddressTable`] maps a raw address to its device category and a
//! human-readable German label, the same names the panel's own programming
//! software uses. Classification is a pure function of the table.

/// Device category of a panel address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressCategory {
    /// Conventional detector group input.
    Meldergruppe,
    /// Addressable detector on the detector bus.
    Melderbus,
    /// Keypad contact (tamper, no-answer, special key).
    Bedienteil,
    /// Switchable or signalling output.
    Output,
    /// Per-area status bit cell.
    AreaStatus,
    /// Not covered by any configured range.
    Unknown,
}

/// Result of classifying one address.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Classified {
    pub category: AddressCategory,
    pub label: String,
    /// 1-based index within the category (area number, group number,
    /// output offset…); 0 for Unknown.
    pub index: u32,
}

/// Address range layout of a panel.
///
/// The defaults match a complex400 with standard programming; panels with
/// extension boards shift the boundaries, so every bound is configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AddressTable {
    pub detector_groups_end: u16,
    pub melderbus_end: u16,
    pub addresses_per_strang: u16,
    pub keypads_start: u16,
    pub keypads_end: u16,
    pub contacts_per_keypad: u16,
    pub outputs_start: u16,
    pub outputs_end: u16,
    pub area_status_start: u16,
    pub area_status_end: u16,
}

impl Default for AddressTable {
    fn default() -> Self {
        Self {
            detector_groups_end: 0x0027,
            melderbus_end: 0x00AF,
            addresses_per_strang: 0x40,
            keypads_start: 0x00B0,
            keypads_end: 0x00EF,
            contacts_per_keypad: 4,
            outputs_start: 0x0500,
            outputs_end: 0x077F,
            area_status_start: 0x0530,
            area_status_end: 0x056F,
        }
    }
}

const KEYPAD_CONTACT_NAMES: [&str; 4] =
    ["Deckelkontakt BT", "Deckelkontakt AT", "Keine Antwort", "Sondertaste"];

impl AddressTable {
    /// Classify a raw address into category, label and index.
    pub fn classify(&self, address: u16) -> Classified {
        // The area-status cells sit inside the output range and take
        // precedence over the generic output rule.
        if let Some((area, _)) = self.area_bit(address) {
            return Classified {
                category: AddressCategory::AreaStatus,
                label: format!("Sicherungsbereich {area}"),
                index: u32::from(area),
            };
        }

        if address <= self.detector_groups_end {
            let n = u32::from(address) + 1;
            return Classified {
                category: AddressCategory::Meldergruppe,
                label: format!("Meldergruppe {n}"),
                index: n,
            };
        }

        if address <= self.melderbus_end {
            let offset = address - self.detector_groups_end - 1;
            let strang = offset / self.addresses_per_strang + 1;
            let melder = offset % self.addresses_per_strang + 1;
            return Classified {
                category: AddressCategory::Melderbus,
                label: format!("Melderbus Strang {strang} Adresse {melder}"),
                index: u32::from(offset) + 1,
            };
        }

        if (self.keypads_start..=self.keypads_end).contains(&address) {
            let offset = address - self.keypads_start;
            let keypad = offset / self.contacts_per_keypad + 1;
            let contact = offset % self.contacts_per_keypad;
            let contact_name = KEYPAD_CONTACT_NAMES
                .get(contact as usize)
                .copied()
                .unwrap_or("Kontakt");
            return Classified {
                category: AddressCategory::Bedienteil,
                label: format!("Bedienteil {keypad} {contact_name}"),
                index: u32::from(offset) + 1,
            };
        }

        if (self.outputs_start..=self.outputs_end).contains(&address) {
            let offset = address - self.outputs_start;
            return Classified {
                category: AddressCategory::Output,
                label: output_label(address, offset),
                index: u32::from(offset) + 1,
            };
        }

        Classified {
            category: AddressCategory::Unknown,
            label: format!("Adresse 0x{address:04X}"),
            index: 0,
        }
    }

    /// Map an address inside the area-status window to `(area, bit)`.
    /// Areas get 8 bit cells each, starting at 1.
    pub fn area_bit(&self, address: u16) -> Option<(u8, u8)> {
        if !(self.area_status_start..=self.area_status_end).contains(&address) {
            return None;
        }
        let offset = address - self.area_status_start;
        Some(((offset / 8 + 1) as u8, (offset % 8) as u8))
    }

    /// Number of areas the status window can carry.
    pub fn area_count(&self) -> u8 {
        ((self.area_status_end - self.area_status_start + 1) / 8) as u8
    }

    /// Address a command for `area` is sent to (first bit cell of the area).
    pub fn area_command_address(&self, area: u8) -> u16 {
        self.area_status_start + u16::from(area.saturating_sub(1)) * 8
    }
}

fn output_label(address: u16, offset: u16) -> String {
    match offset {
        0x00..=0x07 => format!("ÜG TA{}", offset + 1),
        0x08..=0x0A => format!("Relais {}", offset - 0x07),
        0x0B => "OSG (Optischer Signalgeber)".to_string(),
        0x0C => "ASG1 (Akustischer Signalgeber 1)".to_string(),
        0x0D => "ASG2 (Akustischer Signalgeber 2)".to_string(),
        _ => format!("Ausgang 0x{address:04X}"),
    }
}
