use askama::Template;

use crate::rpc::wire::IoTune;
use crate::topology::CorePair;

/// Libvirt virtual-network XML backing one agent-managed bridge.
#[derive(Template)]
#[template(
    source = "\
<network>
  <name>{{ name }}</name>
  <bridge name='{{ name }}' stp='off' delay='0'/>
</network>
",
    ext = "xml"
)]
pub struct NetworkTemplate<'a> {
    pub name: &'a str,
}

/// Persistent domain definition. The SMBIOS serial points guest cloud-init
/// at the agent's metadata service; vcpupin entries carry the scheduler's
/// core-pair grants.
#[derive(Template)]
#[template(
    source = "\
<domain type='kvm'>
  <name>{{ name }}</name>
  <memory unit='KiB'>{{ memory_kib }}</memory>
  <currentMemory unit='KiB'>{{ memory_kib }}</currentMemory>
  <vcpu placement='static'>{{ vcpus }}</vcpu>
{%- if !pins.is_empty() %}
  <cputune>
{%- for pin in pins %}
    <vcpupin vcpu='{{ loop.index0 }}' cpuset='{{ pin.physical_core }},{{ pin.logical_core }}'/>
{%- endfor %}
  </cputune>
{%- endif %}
  <resource>
    <partition>/machine</partition>
  </resource>
  <sysinfo type='smbios'>
    <system>
      <entry name='serial'>ds=nocloud-net;s=http://169.254.169.254/</entry>
    </system>
  </sysinfo>
  <os>
    <type arch='x86_64' machine='pc-i440fx-bionic'>hvm</type>
    <boot dev='hd'/>
    <smbios mode='sysinfo'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-model'/>
  <clock offset='utc'>
    <timer name='pit' tickpolicy='delay'/>
    <timer name='rtc' tickpolicy='catchup'/>
    <timer name='hpet' present='no'/>
  </clock>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <emulator>/usr/bin/kvm-spice</emulator>
    <controller type='usb' index='0' model='piix3-uhci'>
      <alias name='usb'/>
    </controller>
    <controller type='pci' index='0' model='pci-root'>
      <alias name='pci.0'/>
    </controller>
    <input type='tablet' bus='usb'>
      <alias name='input0'/>
      <address type='usb' bus='0' port='1'/>
    </input>
    <input type='mouse' bus='ps2'>
      <alias name='input1'/>
    </input>
    <input type='keyboard' bus='ps2'>
      <alias name='input2'/>
    </input>
    <video>
      <model type='cirrus' vram='16384' heads='1' primary='yes'/>
      <alias name='video0'/>
    </video>
    <serial type='pty'>
      <target port='0'/>
      <alias name='serial0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
      <alias name='serial0'/>
    </console>
  </devices>
</domain>
",
    ext = "xml"
)]
pub struct DomainTemplate<'a> {
    pub name: &'a str,
    pub vcpus: u32,
    pub memory_kib: u64,
    pub pins: &'a [CorePair],
}

/// Disk element for hot-attach. Iotune limits appear only when positive.
#[derive(Template)]
#[template(
    source = "\
<disk type='block' device='disk'>
  <driver name='qemu' type='raw' cache='none' io='native' discard='unmap'/>
  <source dev='{{ source_device }}'/>
  <target dev='{{ target_device }}' bus='virtio'/>
{%- if let Some(tune) = iotune %}
{%- if tune.any_positive() %}
  <iotune>
{%- if tune.read_bytes_sec > 0 %}
    <read_bytes_sec>{{ tune.read_bytes_sec }}</read_bytes_sec>
{%- endif %}
{%- if tune.write_bytes_sec > 0 %}
    <write_bytes_sec>{{ tune.write_bytes_sec }}</write_bytes_sec>
{%- endif %}
{%- if tune.read_iops_sec > 0 %}
    <read_iops_sec>{{ tune.read_iops_sec }}</read_iops_sec>
{%- endif %}
{%- if tune.write_iops_sec > 0 %}
    <write_iops_sec>{{ tune.write_iops_sec }}</write_iops_sec>
{%- endif %}
  </iotune>
{%- endif %}
{%- endif %}
</disk>
",
    ext = "xml"
)]
pub struct DiskAttachTemplate<'a> {
    pub source_device: &'a str,
    pub target_device: &'a str,
    pub iotune: Option<IoTune>,
}

/// Disk element for detach; identification only, no tuning.
#[derive(Template)]
#[template(
    source = "\
<disk type='block'>
  <source dev='{{ source_device }}'/>
  <target dev='{{ target_device }}'/>
</disk>
",
    ext = "xml"
)]
pub struct DiskDetachTemplate<'a> {
    pub source_device: &'a str,
    pub target_device: &'a str,
}

/// Guest interface element, used for both attach and detach.
#[derive(Template)]
#[template(
    source = "\
<interface type='bridge'>
  <mac address='{{ mac_address }}'/>
  <source bridge='{{ bridge }}'/>
  <model type='virtio'/>
  <target dev='{{ tap_name }}'/>
  <bandwidth>
    <inbound average='{{ inbound_average }}'/>
    <outbound average='{{ outbound_average }}'/>
  </bandwidth>
</interface>
",
    ext = "xml"
)]
pub struct InterfaceTemplate<'a> {
    pub bridge: &'a str,
    pub tap_name: &'a str,
    pub mac_address: &'a str,
    pub inbound_average: u64,
    pub outbound_average: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_xml_matches_bridge_name() {
        let xml = NetworkTemplate { name: "br1000" }.render().unwrap();
        assert!(xml.contains("<name>br1000</name>"));
        assert!(xml.contains("<bridge name='br1000' stp='off' delay='0'/>"));
    }

    #[test]
    fn domain_xml_carries_cloud_init_serial_and_pins() {
        let pins = [
            CorePair {
                physical_core: 2,
                logical_core: 10,
            },
            CorePair {
                physical_core: 3,
                logical_core: 11,
            },
        ];
        let xml = DomainTemplate {
            name: "vm001",
            vcpus: 2,
            memory_kib: 4 * 1024 * 1024,
            pins: &pins,
        }
        .render()
        .unwrap();
        assert!(xml.contains("ds=nocloud-net;s=http://169.254.169.254/"));
        assert!(xml.contains("machine='pc-i440fx-bionic'"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("<vcpupin vcpu='0' cpuset='2,10'/>"));
        assert!(xml.contains("<vcpupin vcpu='1' cpuset='3,11'/>"));
    }

    #[test]
    fn domain_xml_without_pins_has_no_cputune() {
        let xml = DomainTemplate {
            name: "vm001",
            vcpus: 1,
            memory_kib: 1024,
            pins: &[],
        }
        .render()
        .unwrap();
        assert!(!xml.contains("<cputune>"));
    }

    #[test]
    fn disk_iotune_fields_appear_only_when_positive() {
        let xml = DiskAttachTemplate {
            source_device: "/dev/sdb",
            target_device: "vdb",
            iotune: Some(IoTune {
                read_bytes_sec: 1000,
                write_bytes_sec: 0,
                read_iops_sec: 0,
                write_iops_sec: 50,
            }),
        }
        .render()
        .unwrap();
        assert!(xml.contains("<read_bytes_sec>1000</read_bytes_sec>"));
        assert!(xml.contains("<write_iops_sec>50</write_iops_sec>"));
        assert!(!xml.contains("write_bytes_sec"));
        assert!(!xml.contains("<read_iops_sec>"));
    }

    #[test]
    fn zeroed_iotune_is_omitted_entirely() {
        let xml = DiskAttachTemplate {
            source_device: "/dev/sdb",
            target_device: "vdb",
            iotune: Some(IoTune::default()),
        }
        .render()
        .unwrap();
        assert!(!xml.contains("<iotune>"));
    }

    #[test]
    fn interface_xml_has_bandwidth_and_mac() {
        let xml = InterfaceTemplate {
            bridge: "br1000",
            tap_name: "tap001",
            mac_address: "52:54:00:00:00:01",
            inbound_average: 125000,
            outbound_average: 125000,
        }
        .render()
        .unwrap();
        assert!(xml.contains("<source bridge='br1000'/>"));
        assert!(xml.contains("<target dev='tap001'/>"));
        assert!(xml.contains("<mac address='52:54:00:00:00:01'/>"));
        assert!(xml.contains("<inbound average='125000'/>"));
    }
}
