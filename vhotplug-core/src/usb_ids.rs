//! USB hardware database lookup.
//!
//! Resolves `(vid, pid)` pairs to vendor and product names when udev did
//! not already provide them. The `usb.ids` file is parsed once at startup;
//! lookups are in-memory and never block the event path.

use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Well-known locations of the usb.ids database.
const USB_IDS_PATHS: &[&str] = &["/usr/share/hwdata/usb.ids", "/usr/share/misc/usb.ids"];

/// Pre-loaded vendor/product name database.
#[derive(Debug, Default)]
pub struct UsbIdDb {
    vendors: HashMap<String, String>,
    products: HashMap<(String, String), String>,
}

impl UsbIdDb {
    /// Load the database from the first known location that exists.
    ///
    /// A missing database is not an error: names simply stay unresolved.
    pub fn load_system() -> Self {
        for path in USB_IDS_PATHS {
            let path = Path::new(path);
            if path.exists() {
                match std::fs::read_to_string(path) {
                    Ok(content) => {
                        let db = Self::parse(&content);
                        debug!(
                            path = %path.display(),
                            vendors = db.vendors.len(),
                            "loaded USB id database"
                        );
                        return db;
                    }
                    Err(e) => warn!(path = %path.display(), "failed to read usb.ids: {}", e),
                }
            }
        }
        warn!("no usb.ids database found, device names will come from udev only");
        Self::default()
    }

    /// Parse usb.ids content: vendor lines are `XXXX  name`, product lines
    /// are indented with a tab. The trailing class sections (`C xx`, …) are
    /// ignored.
    pub fn parse(content: &str) -> Self {
        let mut db = Self::default();
        let mut current_vendor: Option<String> = None;

        for line in content.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('\t') {
                if rest.starts_with('\t') {
                    // interface-level entries below products
                    continue;
                }
                if let (Some(vendor), Some((pid, name))) = (&current_vendor, split_id_line(rest)) {
                    db.products.insert((vendor.clone(), pid), name);
                }
            } else if let Some((vid, name)) = split_id_line(line) {
                db.vendors.insert(vid.clone(), name);
                current_vendor = Some(vid);
            } else {
                // class/audio/video sections terminate the device list
                current_vendor = None;
            }
        }
        db
    }

    /// Resolve names for a `(vid, pid)` pair, lowercase hex.
    pub fn lookup(&self, vid: &str, pid: &str) -> (Option<String>, Option<String>) {
        let vendor = self.vendors.get(vid).cloned();
        let product = self.products.get(&(vid.to_string(), pid.to_string())).cloned();
        (vendor, product)
    }
}

fn split_id_line(line: &str) -> Option<(String, String)> {
    let (id, name) = line.split_once("  ")?;
    if id.len() != 4 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((id.to_lowercase(), name.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# usb.ids sample
046d  Logitech, Inc.
\tc077  M105 Optical Mouse
\tc52b  Unifying Receiver
0b95  ASIX Electronics Corp.
\t1790  AX88179 Gigabit Ethernet

C 03  Human Interface Device
\t01  Boot Interface Subclass
\t\t02  Mouse
";

    #[test]
    fn resolves_vendor_and_product() {
        let db = UsbIdDb::parse(SAMPLE);
        let (vendor, product) = db.lookup("046d", "c077");
        assert_eq!(vendor.as_deref(), Some("Logitech, Inc."));
        assert_eq!(product.as_deref(), Some("M105 Optical Mouse"));
    }

    #[test]
    fn resolves_vendor_without_product() {
        let db = UsbIdDb::parse(SAMPLE);
        let (vendor, product) = db.lookup("046d", "ffff");
        assert_eq!(vendor.as_deref(), Some("Logitech, Inc."));
        assert_eq!(product, None);
    }

    #[test]
    fn unknown_pair_resolves_to_none() {
        let db = UsbIdDb::parse(SAMPLE);
        assert_eq!(db.lookup("dead", "beef"), (None, None));
    }

    #[test]
    fn class_sections_are_not_vendors() {
        let db = UsbIdDb::parse(SAMPLE);
        // "C 03" must not be parsed as a vendor, and the mouse subclass
        // entry must not land under ASIX.
        assert_eq!(db.lookup("c 03", "01"), (None, None));
        assert_eq!(db.lookup("0b95", "01"), (None, None));
    }
}
