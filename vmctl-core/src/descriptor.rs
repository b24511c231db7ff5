//! VM descriptor (libvirt domain XML) rendering.
//!
//! Descriptors come either from the built-in KVM template or from a user
//! template file with `VM_NAME`-style placeholders.

use crate::error::{Result, VmctlError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Parameters interpolated into a descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorParams {
    pub vm_name: String,
    pub memory_mib: u32,
    pub vcpus: u32,
    pub disk_path: PathBuf,
    /// Install medium attached as an IDE CD-ROM, if any
    pub iso_image: Option<PathBuf>,
    /// libvirt network the NIC is attached to
    pub network: String,
    pub mac_address: String,
}

impl DescriptorParams {
    pub fn memory_kib(&self) -> u64 {
        u64::from(self.memory_mib) * 1024
    }
}

/// Descriptor source.
#[derive(Debug, Clone, Default)]
pub enum DescriptorTemplate {
    #[default]
    Builtin,
    /// Template file with `VM_NAME`, `DISK_IMAGE_PATH`, `MEMORY_KIB`, `VCPUS`
    /// and `MAC_ADDRESS` placeholders
    File(PathBuf),
}

impl DescriptorTemplate {
    pub fn from_config(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self::File(p.to_path_buf()),
            None => Self::Builtin,
        }
    }

    /// Render a descriptor for `params`.
    ///
    /// Template files are read on every call, so edits apply to the next
    /// create. An unreadable template is an `InvalidDescriptor`.
    pub async fn render(&self, params: &DescriptorParams) -> Result<String> {
        match self {
            Self::Builtin => Ok(render_builtin(params)),
            Self::File(path) => {
                let template = tokio::fs::read_to_string(path).await.map_err(|e| {
                    VmctlError::InvalidDescriptor {
                        reason: format!("cannot read template {}: {}", path.display(), e),
                    }
                })?;
                render_template(&template, params)
            }
        }
    }
}

/// Deterministic locally-administered MAC for a VM name (QEMU OUI `52:54:00`).
pub fn mac_for(vm_name: &str) -> String {
    let digest = Sha256::digest(vm_name.as_bytes());
    format!("52:54:00:{:02x}:{:02x}:{:02x}", digest[0], digest[1], digest[2])
}

/// Escape text for use inside XML element content or attribute values.
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Extract the domain name from a descriptor's first `<name>` element.
pub fn domain_name(descriptor: &str) -> Option<String> {
    let start = descriptor.find("<name>")? + "<name>".len();
    let len = descriptor[start..].find("</name>")?;
    let name = xml_unescape(descriptor[start..start + len].trim());
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn render_builtin(params: &DescriptorParams) -> String {
    let name = xml_escape(&params.vm_name);
    let disk = xml_escape(&params.disk_path.to_string_lossy());
    let network = xml_escape(&params.network);
    let mac = xml_escape(&params.mac_address);

    let (cdrom_boot, cdrom_device) = match &params.iso_image {
        Some(iso) => (
            "\n    <boot dev='cdrom'/>",
            format!(
                "
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{}'/>
      <target dev='hdc' bus='ide'/>
      <readonly/>
    </disk>",
                xml_escape(&iso.to_string_lossy())
            ),
        ),
        None => ("", String::new()),
    };

    format!(
        "<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='x86_64' machine='pc'>hvm</type>
    <boot dev='hd'/>{cdrom_boot}
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>{cdrom_device}
    <interface type='network'>
      <mac address='{mac}'/>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <channel type='unix'>
      <source mode='bind'/>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'/>
  </devices>
</domain>
",
        memory_kib = params.memory_kib(),
        vcpus = params.vcpus,
    )
}

fn render_template(template: &str, params: &DescriptorParams) -> Result<String> {
    if !template.contains("VM_NAME") {
        return Err(VmctlError::InvalidDescriptor {
            reason: "template has no VM_NAME placeholder".to_string(),
        });
    }

    let values = [
        ("VM_NAME", xml_escape(&params.vm_name)),
        ("DISK_IMAGE_PATH", xml_escape(&params.disk_path.to_string_lossy())),
        ("MEMORY_KIB", params.memory_kib().to_string()),
        ("VCPUS", params.vcpus.to_string()),
        ("MAC_ADDRESS", xml_escape(&params.mac_address)),
    ];

    // Single pass, so substituted values are never rescanned for placeholders
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    'scan: while !rest.is_empty() {
        for (placeholder, value) in &values {
            if let Some(tail) = rest.strip_prefix(placeholder) {
                out.push_str(value);
                rest = tail;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(name: &str) -> DescriptorParams {
        DescriptorParams {
            vm_name: name.to_string(),
            memory_mib: 1024,
            vcpus: 2,
            disk_path: PathBuf::from("/var/lib/vmctl/images/web_1.qcow2"),
            iso_image: None,
            network: "default".to_string(),
            mac_address: mac_for(name),
        }
    }

    #[tokio::test]
    async fn test_builtin_descriptor() {
        let xml = DescriptorTemplate::Builtin.render(&params("web_1")).await.unwrap();
        assert!(xml.contains("<name>web_1</name>"));
        assert!(xml.contains("<memory unit='KiB'>1048576</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("/var/lib/vmctl/images/web_1.qcow2"));
        assert!(!xml.contains("cdrom"));
        assert_eq!(domain_name(&xml).as_deref(), Some("web_1"));
    }

    #[tokio::test]
    async fn test_builtin_descriptor_with_iso() {
        let mut p = params("web_1");
        p.iso_image = Some(PathBuf::from("/isos/ubuntu.iso"));
        let xml = DescriptorTemplate::Builtin.render(&p).await.unwrap();
        assert!(xml.contains("<boot dev='cdrom'/>"));
        assert!(xml.contains("<source file='/isos/ubuntu.iso'/>"));
    }

    #[tokio::test]
    async fn test_values_are_escaped() {
        let xml = DescriptorTemplate::Builtin.render(&params("a<b>&'c")).await.unwrap();
        assert!(xml.contains("<name>a&lt;b&gt;&amp;&apos;c</name>"));
        assert_eq!(domain_name(&xml).as_deref(), Some("a<b>&'c"));
    }

    #[test]
    fn test_mac_is_stable_and_distinct() {
        assert_eq!(mac_for("web_1"), mac_for("web_1"));
        assert_ne!(mac_for("web_1"), mac_for("web_2"));
        assert!(mac_for("web_1").starts_with("52:54:00:"));
        assert_eq!(mac_for("web_1").len(), 17);
    }

    #[tokio::test]
    async fn test_file_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ubuntu.xml");
        std::fs::write(
            &path,
            "<domain><name>VM_NAME</name><memory unit='KiB'>MEMORY_KIB</memory>\
             <source file='DISK_IMAGE_PATH'/><mac address='MAC_ADDRESS'/></domain>",
        )
        .unwrap();

        let xml = DescriptorTemplate::File(path).render(&params("hadoop_2")).await.unwrap();
        assert!(xml.contains("<name>hadoop_2</name>"));
        assert!(xml.contains("1048576"));
        assert!(xml.contains("web_1.qcow2"));
        assert!(!xml.contains("MAC_ADDRESS"));
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        let xml = render_template("<name>VM_NAME</name><vcpu>VCPUS</vcpu>", &params("VCPUS_1"))
            .unwrap();
        assert_eq!(xml, "<name>VCPUS_1</name><vcpu>2</vcpu>");
    }

    #[test]
    fn test_template_without_name_placeholder() {
        let err = render_template("<domain/>", &params("x")).unwrap_err();
        assert!(matches!(err, VmctlError::InvalidDescriptor { .. }));
    }

    #[tokio::test]
    async fn test_missing_template_file() {
        let err = DescriptorTemplate::File(PathBuf::from("/nonexistent/t.xml"))
            .render(&params("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, VmctlError::InvalidDescriptor { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidDescriptor);
        assert!(err.to_string().contains("/nonexistent/t.xml"));
    }
}
