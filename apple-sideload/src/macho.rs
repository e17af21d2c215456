// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entitlements extraction from Mach-O binaries.
//!
//! A signed Mach-O carries its entitlements as a plist blob inside the
//! embedded code signature SuperBlob (slot 5). Re-signing needs the
//! previous entitlements to derive required capabilities, so this module
//! walks the `LC_CODE_SIGNATURE` load command and pulls that one blob out.
//! Nothing else in the signature is parsed or verified here.

use {
    crate::error::SideloadError,
    goblin::mach::{Mach, MachO},
    std::path::Path,
};

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;

/// SuperBlob slot index holding the plist entitlements.
const CSSLOT_ENTITLEMENTS: u32 = 5;

/// Read the entitlements dictionary embedded in an executable.
///
/// Unsigned binaries and signed binaries without an entitlements blob yield
/// an empty dictionary. Universal binaries are read through their first
/// architecture; entitlements are invariant across slices in practice.
pub fn executable_entitlements(path: &Path) -> Result<plist::Dictionary, SideloadError> {
    let data = std::fs::read(path)?;

    match Mach::parse(&data)? {
        Mach::Binary(macho) => entitlements_from_macho(&macho, &data),
        Mach::Fat(fat) => {
            let arch = fat
                .iter_arches()
                .next()
                .ok_or_else(|| {
                    SideloadError::InvalidApp(
                        "universal binary has no architectures".to_string(),
                    )
                })??;

            let offset = arch.offset as usize;
            let size = arch.size as usize;
            let slice = data.get(offset..offset + size).ok_or_else(|| {
                SideloadError::InvalidApp(
                    "universal binary slice extends past end of file".to_string(),
                )
            })?;

            let macho = MachO::parse(slice, 0)?;

            entitlements_from_macho(&macho, slice)
        }
    }
}

fn entitlements_from_macho(
    macho: &MachO<'_>,
    data: &[u8],
) -> Result<plist::Dictionary, SideloadError> {
    use goblin::mach::load_command::CommandVariant;

    let signature_command = macho.load_commands.iter().find_map(|command| {
        match command.command {
            CommandVariant::CodeSignature(linkedit) => Some(linkedit),
            _ => None,
        }
    });

    let linkedit = match signature_command {
        Some(linkedit) => linkedit,
        None => return Ok(plist::Dictionary::new()),
    };

    let start = linkedit.dataoff as usize;
    let end = start + linkedit.datasize as usize;

    let signature = data
        .get(start..end)
        .ok_or_else(|| SideloadError::InvalidApp("code signature extends past end of binary".to_string()))?;

    match entitlements_blob(signature) {
        Some(xml) => {
            let value = plist::Value::from_reader_xml(std::io::Cursor::new(xml))?;

            Ok(value.into_dictionary().unwrap_or_default())
        }
        None => Ok(plist::Dictionary::new()),
    }
}

/// Locate the entitlements blob payload within a SuperBlob.
fn entitlements_blob(signature: &[u8]) -> Option<&[u8]> {
    if read_u32_be(signature, 0)? != CSMAGIC_EMBEDDED_SIGNATURE {
        return None;
    }

    let count = read_u32_be(signature, 8)? as usize;

    for index in 0..count {
        let entry = 12 + index * 8;
        let slot = read_u32_be(signature, entry)?;
        let offset = read_u32_be(signature, entry + 4)? as usize;

        if slot != CSSLOT_ENTITLEMENTS {
            continue;
        }

        if read_u32_be(signature, offset)? != CSMAGIC_EMBEDDED_ENTITLEMENTS {
            return None;
        }

        // Blob length includes the 8-byte magic/length header.
        let length = read_u32_be(signature, offset + 4)? as usize;
        if length < 8 {
            return None;
        }

        return signature.get(offset + 8..offset + length);
    }

    None
}

fn read_u32_be(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|bytes| u32::from_be_bytes(bytes.try_into().expect("slice is 4 bytes")))
}

#[cfg(test)]
mod test {
    use super::*;

    const ENTITLEMENTS_XML: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>application-identifier</key>
    <string>6053B555.com.example.app</string>
    <key>com.apple.security.application-groups</key>
    <array>
        <string>group.com.example</string>
    </array>
</dict>
</plist>"#;

    /// Assemble a SuperBlob holding one entitlements blob.
    fn synthetic_signature(slot: u32, blob_magic: u32) -> Vec<u8> {
        let blob_offset = 12 + 8u32;
        let blob_length = 8 + ENTITLEMENTS_XML.len() as u32;

        let mut signature = Vec::new();
        signature.extend_from_slice(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        signature.extend_from_slice(&(12 + 8 + blob_length).to_be_bytes());
        signature.extend_from_slice(&1u32.to_be_bytes());
        signature.extend_from_slice(&slot.to_be_bytes());
        signature.extend_from_slice(&blob_offset.to_be_bytes());
        signature.extend_from_slice(&blob_magic.to_be_bytes());
        signature.extend_from_slice(&blob_length.to_be_bytes());
        signature.extend_from_slice(ENTITLEMENTS_XML);

        signature
    }

    #[test]
    fn entitlements_blob_found_in_superblob() {
        let signature = synthetic_signature(CSSLOT_ENTITLEMENTS, CSMAGIC_EMBEDDED_ENTITLEMENTS);

        let payload = entitlements_blob(&signature).unwrap();
        assert_eq!(payload, ENTITLEMENTS_XML);

        let value = plist::Value::from_reader_xml(std::io::Cursor::new(payload)).unwrap();
        let dict = value.into_dictionary().unwrap();
        assert!(dict.get("com.apple.security.application-groups").is_some());
    }

    #[test]
    fn other_slots_are_skipped() {
        let signature = synthetic_signature(0, CSMAGIC_EMBEDDED_ENTITLEMENTS);
        assert!(entitlements_blob(&signature).is_none());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let signature = synthetic_signature(CSSLOT_ENTITLEMENTS, 0xfade0b01);
        assert!(entitlements_blob(&signature).is_none());

        assert!(entitlements_blob(&[0u8; 32]).is_none());
        assert!(entitlements_blob(&[]).is_none());
    }
}
