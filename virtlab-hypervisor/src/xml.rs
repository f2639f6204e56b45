//! XML adapters for libvirt-style domain descriptions.
//!
//! The wire format is a hierarchical document with `name`, `uuid`, `vcpu`,
//! `memory`/`currentMemory`, `os/boot*`, and `devices/{disk,interface,
//! controller}*` elements. The builder renders a typed [`DomainConfig`];
//! the parser reads one back, tolerating elements this layer does not model
//! (consoles, graphics, channels).

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{HypervisorError, Result};
use crate::naming;
use crate::types::*;

/// Builder for libvirt-style domain XML.
pub struct DomainXmlBuilder<'a> {
    config: &'a DomainConfig,
}

impl<'a> DomainXmlBuilder<'a> {
    /// Create a new XML builder for the given domain config.
    pub fn new(config: &'a DomainConfig) -> Self {
        Self { config }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let mut xml = String::new();

        xml.push_str("<domain type='kvm'>\n");
        xml.push_str(&format!("  <name>{}</name>\n", self.config.name));
        if let Some(uuid) = &self.config.uuid {
            xml.push_str(&format!("  <uuid>{uuid}</uuid>\n"));
        }
        xml.push_str(&format!(
            "  <memory unit='MiB'>{}</memory>\n",
            self.config.memory.max_mib
        ));
        xml.push_str(&format!(
            "  <currentMemory unit='MiB'>{}</currentMemory>\n",
            self.config.memory.current_mib
        ));
        xml.push_str(&format!(
            "  <vcpu placement='static'>{}</vcpu>\n",
            self.config.vcpus
        ));

        xml.push_str(&self.build_os_section());

        xml.push_str("  <on_poweroff>destroy</on_poweroff>\n");
        xml.push_str("  <on_reboot>restart</on_reboot>\n");
        xml.push_str("  <on_crash>destroy</on_crash>\n");

        xml.push_str("  <devices>\n");
        for controller in &self.config.controllers {
            xml.push_str(&controller_fragment_xml(controller));
        }
        for disk in &self.config.disks {
            xml.push_str(&disk_fragment_xml(disk));
        }
        for nic in &self.config.nics {
            xml.push_str(&nic_fragment_xml(nic));
        }
        xml.push_str("  </devices>\n");

        xml.push_str("</domain>\n");

        xml
    }

    fn build_os_section(&self) -> String {
        let boot_devs: String = self
            .config
            .boot
            .iter()
            .map(|d| format!("    <boot dev='{}'/>\n", d.as_str()))
            .collect();

        format!(
            "  <os>\n    <type arch='x86_64' machine='q35'>hvm</type>\n{boot_devs}  </os>\n"
        )
    }
}

/// Render a single disk as a device fragment.
pub fn disk_fragment_xml(disk: &DiskConfig) -> String {
    let mut xml = String::new();

    xml.push_str(&format!(
        "    <disk type='file' device='{}'>\n",
        disk.device.as_str()
    ));
    xml.push_str(&format!(
        "      <driver name='qemu' type='{}'/>\n",
        disk.format.as_str()
    ));
    if !disk.source.is_empty() {
        xml.push_str(&format!("      <source file='{}'/>\n", disk.source));
    }
    xml.push_str(&format!(
        "      <target dev='{}' bus='{}'/>\n",
        disk.address.device_name(),
        disk.address.bus.as_str()
    ));
    xml.push_str(&format!(
        "      <address type='drive' controller='{}' unit='{}'/>\n",
        disk.address.controller,
        disk.address.unit()
    ));
    if disk.readonly {
        xml.push_str("      <readonly/>\n");
    }
    xml.push_str("    </disk>\n");

    xml
}

/// Render a single NIC as a device fragment.
pub fn nic_fragment_xml(nic: &NicConfig) -> String {
    let mut xml = String::new();

    let (iface_type, source) = match (&nic.bridge, nic.network.is_empty()) {
        (Some(bridge), _) => ("bridge", format!("      <source bridge='{bridge}'/>\n")),
        (None, false) => (
            "network",
            format!("      <source network='{}'/>\n", nic.network),
        ),
        (None, true) => ("bridge", String::new()),
    };

    xml.push_str(&format!("    <interface type='{iface_type}'>\n"));
    if let Some(mac) = &nic.mac {
        xml.push_str(&format!("      <mac address='{mac}'/>\n"));
    }
    xml.push_str(&source);
    xml.push_str(&format!("      <model type='{}'/>\n", nic.model.as_str()));
    xml.push_str("    </interface>\n");

    xml
}

/// Render a single controller as a device fragment.
pub fn controller_fragment_xml(controller: &ControllerConfig) -> String {
    match &controller.model {
        Some(model) => format!(
            "    <controller type='{}' index='{}' model='{model}'/>\n",
            controller.bus.as_str(),
            controller.index
        ),
        None => format!(
            "    <controller type='{}' index='{}'/>\n",
            controller.bus.as_str(),
            controller.index
        ),
    }
}

/// Parse a libvirt-style domain description into a typed config.
pub fn parse_domain_xml(xml: &str) -> Result<DomainConfig> {
    DomainXmlParser::default().parse(xml)
}

#[derive(Default)]
struct DomainXmlParser {
    config: ParsedDomain,
    depth_in_devices: bool,
    in_os: bool,
    text_target: Option<TextTarget>,
    disk: Option<PartialDisk>,
    nic: Option<PartialNic>,
}

// Accumulator for top-level fields while parsing
#[derive(Default)]
struct ParsedDomain {
    name: String,
    uuid: Option<String>,
    vcpus: u32,
    current_mib: u64,
    max_mib: u64,
    disks: Vec<DiskConfig>,
    nics: Vec<NicConfig>,
    controllers: Vec<ControllerConfig>,
    boot: Vec<BootDevice>,
}

enum TextTarget {
    Name,
    Uuid,
    Memory,
    CurrentMemory,
    Vcpu,
}

#[derive(Default)]
struct PartialDisk {
    device: Option<String>,
    format: Option<String>,
    source: Option<String>,
    target_dev: Option<String>,
    target_bus: Option<String>,
    address_controller: Option<u32>,
    address_unit: Option<u32>,
    readonly: bool,
}

#[derive(Default)]
struct PartialNic {
    mac: Option<String>,
    bridge: Option<String>,
    network: Option<String>,
    model: Option<String>,
}

fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    let found = e
        .try_get_attribute(name)
        .map_err(|err| HypervisorError::Xml(err.to_string()))?;
    match found {
        Some(a) => {
            let value = a
                .unescape_value()
                .map_err(|err| HypervisorError::Xml(err.to_string()))?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

fn attr_u32(e: &BytesStart<'_>, name: &str) -> Result<Option<u32>> {
    match attr(e, name)? {
        Some(v) => v
            .parse::<u32>()
            .map(Some)
            .map_err(|_| HypervisorError::Xml(format!("bad numeric attribute {name}='{v}'"))),
        None => Ok(None),
    }
}

impl DomainXmlParser {
    fn parse(mut self, xml: &str) -> Result<DomainConfig> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        loop {
            match reader.read_event() {
                Err(e) => {
                    return Err(HypervisorError::Xml(format!(
                        "parse error at byte {}: {e}",
                        reader.buffer_position()
                    )))
                }
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) => self.open(&e, false)?,
                Ok(Event::Empty(e)) => self.open(&e, true)?,
                Ok(Event::End(e)) => self.close(e.name().as_ref())?,
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|err| HypervisorError::Xml(err.to_string()))?;
                    self.text(&text);
                }
                Ok(_) => {}
            }
        }

        self.finish()
    }

    fn open(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<()> {
        let name = e.name();
        match name.as_ref() {
            b"devices" => self.depth_in_devices = true,
            b"os" => self.in_os = true,
            b"name" if !self.depth_in_devices => self.text_target = Some(TextTarget::Name),
            b"uuid" if !self.depth_in_devices => self.text_target = Some(TextTarget::Uuid),
            b"memory" => self.text_target = Some(TextTarget::Memory),
            b"currentMemory" => self.text_target = Some(TextTarget::CurrentMemory),
            b"vcpu" => self.text_target = Some(TextTarget::Vcpu),
            b"boot" if self.in_os => {
                if let Some(dev) = attr(e, "dev")? {
                    self.config.boot.push(BootDevice::parse(&dev)?);
                }
            }
            b"disk" if self.depth_in_devices => {
                self.disk = Some(PartialDisk {
                    device: attr(e, "device")?,
                    ..Default::default()
                });
                if empty {
                    self.close(b"disk")?;
                }
            }
            b"interface" if self.depth_in_devices => {
                self.nic = Some(PartialNic::default());
                if empty {
                    self.close(b"interface")?;
                }
            }
            b"controller" if self.depth_in_devices => {
                // only storage controllers are modeled; pci/usb are skipped
                if let Some(kind) = attr(e, "type")? {
                    if let Ok(bus) = DiskBus::parse(&kind) {
                        let index = attr_u32(e, "index")?.unwrap_or(0);
                        let model = attr(e, "model")?;
                        self.config.controllers.push(ControllerConfig {
                            bus,
                            index,
                            model,
                        });
                    }
                }
            }
            b"driver" => {
                if let Some(disk) = self.disk.as_mut() {
                    disk.format = attr(e, "type")?;
                }
            }
            b"source" => {
                if let Some(disk) = self.disk.as_mut() {
                    disk.source = attr(e, "file")?;
                } else if let Some(nic) = self.nic.as_mut() {
                    nic.bridge = attr(e, "bridge")?;
                    nic.network = attr(e, "network")?;
                }
            }
            b"target" => {
                if let Some(disk) = self.disk.as_mut() {
                    disk.target_dev = attr(e, "dev")?;
                    disk.target_bus = attr(e, "bus")?;
                }
            }
            b"address" => {
                if let Some(disk) = self.disk.as_mut() {
                    if attr(e, "type")?.as_deref() == Some("drive") {
                        disk.address_controller = attr_u32(e, "controller")?;
                        disk.address_unit = attr_u32(e, "unit")?;
                    }
                }
            }
            b"readonly" => {
                if let Some(disk) = self.disk.as_mut() {
                    disk.readonly = true;
                }
            }
            b"mac" => {
                if let Some(nic) = self.nic.as_mut() {
                    nic.mac = attr(e, "address")?;
                }
            }
            b"model" => {
                if let Some(nic) = self.nic.as_mut() {
                    nic.model = attr(e, "type")?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &[u8]) -> Result<()> {
        match name {
            b"devices" => self.depth_in_devices = false,
            b"os" => self.in_os = false,
            b"disk" => {
                if let Some(partial) = self.disk.take() {
                    let disk = Self::finish_disk(partial)?;
                    self.config.disks.push(disk);
                }
            }
            b"interface" => {
                if let Some(partial) = self.nic.take() {
                    let index = self.config.nics.len() as u32;
                    let model = match partial.model.as_deref() {
                        Some(m) => NicModel::parse(m)?,
                        None => NicModel::Virtio,
                    };
                    self.config.nics.push(NicConfig {
                        index,
                        mac: partial.mac,
                        network: partial.network.unwrap_or_default(),
                        bridge: partial.bridge,
                        model,
                    });
                }
            }
            _ => {}
        }
        self.text_target = None;
        Ok(())
    }

    fn text(&mut self, text: &str) {
        match self.text_target {
            Some(TextTarget::Name) => self.config.name = text.to_string(),
            Some(TextTarget::Uuid) => self.config.uuid = Some(text.to_string()),
            Some(TextTarget::Memory) => self.config.max_mib = text.parse().unwrap_or(0),
            Some(TextTarget::CurrentMemory) => {
                self.config.current_mib = text.parse().unwrap_or(0)
            }
            Some(TextTarget::Vcpu) => self.config.vcpus = text.parse().unwrap_or(0),
            None => {}
        }
    }

    fn finish_disk(partial: PartialDisk) -> Result<DiskConfig> {
        let bus = match partial.target_bus.as_deref() {
            Some(b) => DiskBus::parse(b)?,
            None => return Err(HypervisorError::Xml("disk without target bus".to_string())),
        };

        let (controller, slot) = match (partial.address_controller, partial.address_unit) {
            (Some(controller), Some(unit)) => {
                (controller, naming::controller_base(controller) + unit)
            }
            _ => {
                let dev = partial
                    .target_dev
                    .as_deref()
                    .ok_or_else(|| HypervisorError::Xml("disk without target dev".to_string()))?;
                let slot = naming::slot_from_device_name(bus, dev)?;
                (slot / naming::SLOTS_PER_CONTROLLER, slot)
            }
        };

        let device = match partial.device.as_deref() {
            Some("cdrom") => DeviceKind::Cdrom,
            _ => DeviceKind::Disk,
        };

        let format = match partial.format.as_deref() {
            Some(f) => DiskFormat::parse(f)?,
            None => DiskFormat::Raw,
        };

        Ok(DiskConfig {
            source: partial.source.unwrap_or_default(),
            address: DiskAddress::new(bus, controller, slot),
            size_gib: 0,
            format,
            device,
            readonly: partial.readonly,
        })
    }

    fn finish(self) -> Result<DomainConfig> {
        let parsed = self.config;
        if parsed.name.is_empty() {
            return Err(HypervisorError::Xml("domain without a name".to_string()));
        }

        let mut config = DomainConfig::new(parsed.name);
        config.uuid = parsed.uuid;
        config.vcpus = parsed.vcpus;
        config.memory = MemoryConfig {
            current_mib: if parsed.current_mib > 0 {
                parsed.current_mib
            } else {
                parsed.max_mib
            },
            max_mib: parsed.max_mib,
        };
        config.disks = parsed.disks;
        config.nics = parsed.nics;
        config.controllers = parsed.controllers;
        if !parsed.boot.is_empty() {
            config.boot = parsed.boot;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> DomainConfig {
        let mut config = DomainConfig::new("test-vm")
            .with_vcpus(4)
            .with_memory(4096)
            .with_controller(ControllerConfig::new(DiskBus::Scsi, 1).with_model("virtio-scsi"))
            .with_disk(DiskConfig::new(
                "pool/test-vm.qcow2",
                DiskAddress::new(DiskBus::Virtio, 0, 0),
            ))
            .with_disk(DiskConfig::new(
                "pool/test-vm-data.qcow2",
                DiskAddress::new(DiskBus::Scsi, 1, 18),
            ))
            .with_disk(DiskConfig::cdrom(
                "isos/install.iso",
                DiskAddress::new(DiskBus::Ide, 0, 0),
            ));
        config.uuid = Some("f9c1b2aa-0001-4a73-9d5d-2d42f1c7be11".to_string());
        let mut nic = NicConfig::new("lab");
        nic.mac = Some("52:54:00:12:34:56".to_string());
        nic.bridge = Some("virbr0".to_string());
        config.nics.push(nic);
        config.boot = vec![BootDevice::Disk, BootDevice::Cdrom];
        config
    }

    #[test]
    fn test_basic_xml_generation() {
        let config = sample_config();
        let xml = DomainXmlBuilder::new(&config).build();

        assert!(xml.contains("<name>test-vm</name>"));
        assert!(xml.contains("<memory unit='MiB'>4096</memory>"));
        assert!(xml.contains("<vcpu placement='static'>4</vcpu>"));
        assert!(xml.contains("pool/test-vm.qcow2"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        // scsi/1 slot 18 renders as sds, unit 2 on controller 1
        assert!(xml.contains("<target dev='sds' bus='scsi'/>"));
        assert!(xml.contains("<address type='drive' controller='1' unit='2'/>"));
        assert!(xml.contains("<controller type='scsi' index='1' model='virtio-scsi'/>"));
        assert!(xml.contains("<boot dev='hd'/>"));
        assert!(xml.contains("<boot dev='cdrom'/>"));
        assert!(xml.contains("device='cdrom'"));
        assert!(xml.contains("<readonly/>"));
    }

    #[test]
    fn test_parse_roundtrip_preserves_devices() {
        let config = sample_config();
        let xml = DomainXmlBuilder::new(&config).build();
        let parsed = parse_domain_xml(&xml).unwrap();

        assert_eq!(parsed.name, config.name);
        assert_eq!(parsed.uuid, config.uuid);
        assert_eq!(parsed.vcpus, config.vcpus);
        assert_eq!(parsed.memory, config.memory);
        assert_eq!(parsed.boot, config.boot);
        assert_eq!(parsed.controllers, config.controllers);
        assert_eq!(parsed.disks.len(), config.disks.len());
        for (parsed_disk, original) in parsed.disks.iter().zip(&config.disks) {
            assert_eq!(parsed_disk.source, original.source);
            assert_eq!(parsed_disk.address, original.address);
            assert_eq!(parsed_disk.device, original.device);
            assert_eq!(parsed_disk.readonly, original.readonly);
        }
        assert_eq!(parsed.nics.len(), 1);
        assert_eq!(parsed.nics[0].mac, config.nics[0].mac);
        assert_eq!(parsed.nics[0].bridge, config.nics[0].bridge);
        assert_eq!(parsed.nics[0].model, config.nics[0].model);

        // and building again yields the same document
        let rebuilt = DomainXmlBuilder::new(&parsed).build();
        assert_eq!(xml, rebuilt);
    }

    #[test]
    fn test_parse_ignores_unmodeled_elements() {
        let xml = r#"<domain type='kvm'>
  <name>extra</name>
  <memory unit='MiB'>1024</memory>
  <currentMemory unit='MiB'>1024</currentMemory>
  <vcpu placement='static'>1</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <controller type='pci' index='0' model='pcie-root'/>
    <disk type='file' device='disk'>
      <driver name='qemu' type='raw'/>
      <source file='vols/extra.img'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <serial type='pty'><target port='0'/></serial>
    <graphics type='vnc' port='-1' autoport='yes'/>
  </devices>
</domain>"#;

        let parsed = parse_domain_xml(xml).unwrap();
        assert_eq!(parsed.name, "extra");
        assert_eq!(parsed.disks.len(), 1);
        // pci controller is not a storage bus and is skipped
        assert!(parsed.controllers.is_empty());
        // address derived from the device letters
        assert_eq!(parsed.disks[0].address.slot, 0);
        assert_eq!(parsed.disks[0].address.controller, 0);
    }

    #[test]
    fn test_parse_address_beats_device_letters() {
        let xml = r#"<domain type='kvm'>
  <name>addr</name>
  <memory unit='MiB'>512</memory>
  <currentMemory unit='MiB'>512</currentMemory>
  <vcpu placement='static'>1</vcpu>
  <devices>
    <controller type='scsi' index='2'/>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='vols/deep.qcow2'/>
      <target dev='sdah' bus='scsi'/>
      <address type='drive' controller='2' unit='1'/>
    </disk>
  </devices>
</domain>"#;

        let parsed = parse_domain_xml(xml).unwrap();
        let address = parsed.disks[0].address;
        assert_eq!(address.controller, 2);
        assert_eq!(address.slot, 33);
        assert_eq!(address.device_name(), "sdah");
    }

    #[test]
    fn test_parse_missing_name_is_error() {
        let xml = "<domain type='kvm'><vcpu>1</vcpu></domain>";
        assert!(matches!(
            parse_domain_xml(xml),
            Err(HypervisorError::Xml(_))
        ));
    }

    #[test]
    fn test_empty_cdrom_has_no_source() {
        let config = DomainConfig::new("nocd").with_disk(DiskConfig::cdrom(
            "",
            DiskAddress::new(DiskBus::Ide, 0, 1),
        ));
        let xml = DomainXmlBuilder::new(&config).build();
        assert!(!xml.contains("<source"));

        let parsed = parse_domain_xml(&xml).unwrap();
        assert_eq!(parsed.disks[0].source, "");
        assert_eq!(parsed.disks[0].device, DeviceKind::Cdrom);
    }
}
